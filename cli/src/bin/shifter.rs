//! Interactive entry point: `shifter -i <type>:<tag> [opts] -- <cmd> <args>`.

use std::ffi::CString;

use clap::Parser;
use udicore_lib::config::RuntimeConfig;
use udicore_lib::image_metadata::ImageMetadata;
use udicore_lib::mount_list::MountList;
use udicore_lib::orchestrator::{self, SetupRequest};
use udicore_lib::volume_map::VolumeMap;

/// Run a command inside an already-composed container image.
#[derive(Parser, Debug)]
#[command(name = "shifter", disable_help_flag = false)]
struct Args {
    /// Emit verbose diagnostics to stderr.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// `type:tag` image descriptor.
    #[arg(short = 'i', long = "image")]
    image: Option<String>,

    /// Use the image's declared entrypoint, optionally overridden.
    #[arg(long = "entrypoint", num_args = 0..=1, default_missing_value = "")]
    entrypoint: Option<String>,

    /// Working directory inside the container.
    #[arg(short = 'w', long = "workdir")]
    workdir: Option<String>,

    /// `src:tgt[:flag...]`, repeatable; semicolons also split a single
    /// occurrence into multiple entries.
    #[arg(short = 'V', long = "volume")]
    volume: Vec<String>,

    /// Comma-separated module list, threaded through but not interpreted
    /// by the core (module systems are a site concern).
    #[arg(short = 'm', long = "module")]
    module: Option<String>,

    /// Print the composed environment instead of running anything.
    #[arg(short = 'e', long = "env")]
    env: bool,

    /// Command and arguments to run in the container.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn resolve_image_descriptor(args: &Args) -> anyhow::Result<String> {
    if let Some(image) = &args.image {
        return Ok(image.clone());
    }
    for name in ["SHIFTER_IMAGE", "SHIFTER"] {
        if let Some(v) = udicore_cli::env_or_spank(name) {
            return Ok(v);
        }
    }
    anyhow::bail!("no image specified via -i/--image or SHIFTER_IMAGE")
}

fn main() {
    std::env::set_var("POSIXLY_CORRECT", "1");
    udicore_utils::initialize_tracing();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("shifter: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> anyhow::Result<i32> {
    let args = Args::parse();
    let descriptor = resolve_image_descriptor(&args)?;
    let (_image_type, identifier) = descriptor.split_once(':').unwrap_or(("docker", descriptor.as_str()));

    let mut config = RuntimeConfig::from_map(&Default::default());
    let (meta, unknown) = ImageMetadata::load(&config.image_base_path, identifier)?;
    for key in unknown {
        tracing::warn!(key, "unrecognized image metadata key");
    }

    let user_volume_raw = if args.volume.is_empty() {
        udicore_cli::env_or_spank("SHIFTER_VOLUME").unwrap_or_default()
    } else {
        udicore_cli::join_volume_args(&args.volume)
    };
    let user_volume_map = VolumeMap::parse(&user_volume_raw, false)?;

    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();
    let username = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| uid.to_string());

    let req = SetupRequest {
        image_identifier: identifier.to_string(),
        username,
        uid,
        gid,
        aux_gids: nix::unistd::getgroups()?.into_iter().map(|g| g.as_raw()).collect(),
        user_volume_map,
        nodespec: None,
    };

    let mut mounts = MountList::parse()?;
    let entrypoint_requested = args.entrypoint.is_some();
    let (argv, env) = orchestrator::run_interactive(
        &mut config,
        &mut mounts,
        &req,
        &meta,
        entrypoint_requested,
        &args.command,
        args.workdir.as_deref(),
    )?;

    if args.env {
        for (name, value) in &env {
            println!("{name}={value}");
        }
        return Ok(0);
    }

    let program = CString::new(argv[0].as_str())?;
    let argv_c: Vec<CString> = argv.iter().map(|a| CString::new(a.as_str()).unwrap()).collect();
    let env_c: Vec<CString> = env
        .iter()
        .map(|(k, v)| CString::new(format!("{k}={v}")).unwrap())
        .collect();

    match nix::unistd::execvpe(&program, &argv_c, &env_c) {
        Ok(_) => unreachable!("execvpe does not return on success"),
        Err(_) => {
            eprintln!("shifter: execvpe failed for {}", argv[0]);
            Ok(127)
        }
    }
}
