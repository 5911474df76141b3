//! Writers for the portage configuration inside the chroot.
//!
//! make.conf parallelism is derived from the host's computing power; the
//! remaining files are straight renderings of the target settings.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::SettingsError;
use crate::paths::{host_path, TargetPaths};
use crate::settings::{Settings, TargetSettings};

pub struct TargetConfDir<'a> {
    settings: &'a Settings,
    target: &'a TargetSettings,
    dir: PathBuf,
}

impl<'a> TargetConfDir<'a> {
    pub fn new(settings: &'a Settings, target: &'a TargetSettings, chroot_dir: &Path) -> Self {
        Self {
            settings,
            target,
            dir: host_path(chroot_dir, TargetPaths::CONF_DIR),
        }
    }

    pub fn write_all(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating '{}'", self.dir.display()))?;
        self.write_make_conf()?;
        self.write_package_use()?;
        self.write_package_mask()?;
        self.write_package_unmask()?;
        self.write_package_accept_keywords()?;
        self.write_package_license()?;
        Ok(())
    }

    pub fn write_make_conf(&self) -> Result<()> {
        let power = &self.settings.host_computing_power;
        let (make_jobs, make_load) = power.make_jobs();
        let (emerge_jobs, emerge_load) = power.emerge_jobs();
        let opts = &self.target.build_opts;

        let mut buf = String::new();
        buf.push_str(&format!(
            "# These settings were written by {} while assembling this stage.\n",
            self.settings.program_name
        ));
        buf.push_str(
            "# See /usr/share/portage/config/make.conf.example for the full reference.\n\n",
        );

        if self.target.ccache {
            buf.push_str("FEATURES=\"ccache\"\n\n");
        }

        if !opts.common_flags.is_empty() {
            buf.push_str(&format!(
                "COMMON_FLAGS=\"{}\"\n",
                opts.common_flags.join(" ")
            ));
        }
        let has_common = !opts.common_flags.is_empty();
        write_flags(&mut buf, "CFLAGS", &opts.cflags, has_common);
        write_flags(&mut buf, "CXXFLAGS", &opts.cxxflags, has_common);
        write_flags(&mut buf, "FCFLAGS", &opts.fcflags, has_common);
        write_flags(&mut buf, "FFLAGS", &opts.fflags, has_common);
        write_flags(&mut buf, "LDFLAGS", &opts.ldflags, has_common);
        write_flags(&mut buf, "ASFLAGS", &opts.asflags, has_common);
        buf.push('\n');

        // Keep system responses in a predictable locale.
        buf.push_str("LC_MESSAGES=C\n\n");

        // make is handed both the long and short spellings; some ebuilds
        // only forward one of them.
        buf.push_str(&format!(
            "MAKEOPTS=\"--jobs={make_jobs} --load-average={make_load} -j{make_jobs} -l{make_load}\"\n"
        ));
        buf.push_str(&format!(
            "EMERGE_DEFAULT_OPTS=\"--quiet-build=y --jobs={emerge_jobs} --load-average={emerge_load}\"\n"
        ));

        let path = self.dir.join("make.conf");
        fs::write(&path, buf).with_context(|| format!("writing '{}'", path.display()))
    }

    pub fn write_package_use(&self) -> Result<()> {
        let mut buf = String::new();
        // All locales are compiled; INSTALL_MASK is the mechanism for
        // trimming them, so overriding this flag is not allowed.
        buf.push_str("*/* compile-locales\n");
        for (pkg, flags) in &self.target.pkg_use {
            if flags
                .iter()
                .any(|f| f == "compile-locales" || f == "-compile-locales")
            {
                return Err(SettingsError(format!(
                    "USE flag \"compile-locales\" may not be set per package (package \"{pkg}\")"
                ))
                .into());
            }
            buf.push_str(&format!("{pkg} {}\n", flags.join(" ")));
        }

        let path = self.dir.join("package.use");
        fs::write(&path, buf).with_context(|| format!("writing '{}'", path.display()))
    }

    pub fn write_package_mask(&self) -> Result<()> {
        self.write_list_file("package.mask", &self.target.pkg_mask)
    }

    pub fn write_package_unmask(&self) -> Result<()> {
        self.write_list_file("package.unmask", &self.target.pkg_unmask)
    }

    pub fn write_package_accept_keywords(&self) -> Result<()> {
        self.write_map_file("package.accept_keywords", &self.target.pkg_accept_keywords)
    }

    pub fn write_package_license(&self) -> Result<()> {
        self.write_map_file("package.license", &self.target.pkg_license)
    }

    fn write_list_file(&self, name: &str, entries: &[String]) -> Result<()> {
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(entry);
            buf.push('\n');
        }
        let path = self.dir.join(name);
        fs::write(&path, buf).with_context(|| format!("writing '{}'", path.display()))
    }

    fn write_map_file(
        &self,
        name: &str,
        entries: &std::collections::BTreeMap<String, Vec<String>>,
    ) -> Result<()> {
        let mut buf = String::new();
        for (pkg, values) in entries {
            buf.push_str(&format!("{pkg} {}\n", values.join(" ")));
        }
        let path = self.dir.join(name);
        fs::write(&path, buf).with_context(|| format!("writing '{}'", path.display()))
    }
}

fn write_flags(buf: &mut String, name: &str, values: &[String], has_common: bool) {
    if values.is_empty() {
        if has_common {
            buf.push_str(&format!("{name}=\"${{COMMON_FLAGS}}\"\n"));
        }
    } else {
        buf.push_str(&format!("{name}=\"{}\"\n", values.join(" ")));
    }
}
