use std::path::Path;

use anyhow::{bail, Context, Result};

use stage_builder::builder::Builder;
use stage_builder::chroot::{ScriptFromHostFile, ScriptInChroot};
use stage_builder::config::{load_build_config, BuildConfig, PROGRAM_NAME};
use stage_builder::export::{Exporter, SquashfsExporter};
use stage_builder::kernel::Genkernel;
use stage_builder::pipeline::{BuildStep, PROGRESS_RECORD};
use stage_builder::preflight;
use stage_builder::seed::Stage3Archive;
use stage_builder::settings::IdMap;
use stage_builder::workdir::{CheckpointStrategy, WorkDir};

/// Room for the unpacked seed, the package builds and two checkpoint
/// copies.
const MIN_FREE_SPACE_BYTES: u64 = 20 * 1024 * 1024 * 1024;

fn usage() -> &'static str {
    "Usage:\n  stage-builder build <config.toml>\n  stage-builder status <work_dir>\n  stage-builder export-squashfs <work_dir> <output_dir>"
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd, config] if cmd == "build" => cmd_build(Path::new(config)),
        [cmd, work_dir] if cmd == "status" => cmd_status(Path::new(work_dir)),
        [cmd, work_dir, output_dir] if cmd == "export-squashfs" => {
            cmd_export(Path::new(work_dir), Path::new(output_dir))
        }
        _ => bail!(usage()),
    }
}

fn cmd_build(config_path: &Path) -> Result<()> {
    let config = load_build_config(config_path)?;
    let work_dir_path = config.work_dir_path();
    let work_dir = WorkDir::new(&work_dir_path, config.checkpoint_strategy()?);

    preflight::check_host_tools()?;
    if let Some(parent) = work_dir_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
        preflight::ensure_free_space(parent, MIN_FREE_SPACE_BYTES)?;
    }

    let mut builder = if work_dir.has_record(PROGRESS_RECORD) {
        let builder = Builder::resume(work_dir)?;
        println!(
            "[build] resuming from step {} in '{}'",
            builder.progress(),
            work_dir_path.display()
        );
        builder
    } else {
        work_dir.initialize()?;
        println!("[build] starting fresh build in '{}'", work_dir_path.display());
        Builder::new(
            config.settings(),
            config.target_settings(),
            IdMap::identity(),
            work_dir,
        )?
    };

    let seed = Stage3Archive::open(&config.build.seed_archive)?;
    let repositories = config.repositories();
    let custom_scripts = load_custom_scripts(&config)?;
    let script_refs: Vec<&dyn ScriptInChroot> =
        custom_scripts.iter().map(|s| s as &dyn ScriptInChroot).collect();

    loop {
        let step = builder.progress();
        match step {
            BuildStep::Init => builder.unpack(&seed)?,
            BuildStep::Unpacked => builder.init_repositories(&repositories)?,
            BuildStep::RepositoriesReady => builder.init_confdir()?,
            BuildStep::ConfReady => builder.update_world(&[])?,
            BuildStep::WorldUpdated => {
                if config.build.kernel {
                    let installer = Genkernel::new(builder.target_settings().ccache);
                    builder.install_kernel(&installer)?;
                } else {
                    builder.enable_services()?;
                }
            }
            BuildStep::KernelInstalled => builder.enable_services()?,
            BuildStep::ServicesEnabled => builder.customize_system(&script_refs)?,
            BuildStep::Customized => builder.cleanup()?,
            BuildStep::CleanedUp => break,
        }
        println!("[build] reached {}", builder.progress());
    }

    println!("[build] stage complete in '{}'", work_dir_path.display());
    Ok(())
}

fn cmd_status(work_dir_path: &Path) -> Result<()> {
    let work_dir = WorkDir::new(work_dir_path, CheckpointStrategy::Copy);
    work_dir.verify()?;

    let record: serde_json::Value = work_dir
        .load_record(PROGRESS_RECORD)
        .context("no build has been started in this work directory")?;
    println!(
        "progress: {}",
        record.get("step").and_then(|v| v.as_str()).unwrap_or("?")
    );
    if let Some(updated) = record.get("updated_at_utc").and_then(|v| v.as_str()) {
        println!("updated:  {updated}");
    }

    let checkpoints = work_dir.list_checkpoints()?;
    if checkpoints.is_empty() {
        println!("checkpoints: none");
    } else {
        println!("checkpoints:");
        for name in checkpoints {
            let size = work_dir.checkpoint_size(&name).unwrap_or(0);
            println!("  {name}  ({:.1} MiB)", size as f64 / (1024.0 * 1024.0));
        }
    }
    if work_dir.has_current() {
        println!("note: an unsealed chroot directory exists (failed or in-flight action)");
    }
    Ok(())
}

fn cmd_export(work_dir_path: &Path, output_dir: &Path) -> Result<()> {
    let work_dir = WorkDir::new(work_dir_path, CheckpointStrategy::Copy);
    work_dir.verify()?;

    let builder = Builder::resume(work_dir)?;
    if builder.progress() != BuildStep::CleanedUp {
        bail!(
            "build is at {}; finish it before exporting",
            builder.progress()
        );
    }

    let exporter = SquashfsExporter::into_dir(output_dir);
    exporter.export(builder.settings(), builder.work_dir())?;
    println!("[{PROGRAM_NAME}] export complete");
    Ok(())
}

fn load_custom_scripts(config: &BuildConfig) -> Result<Vec<ScriptFromHostFile>> {
    config
        .target
        .custom_scripts
        .iter()
        .map(|path| {
            ScriptFromHostFile::new(&format!("custom script {}", path.display()), path)
        })
        .collect()
}
