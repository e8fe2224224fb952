//! Privileged, once-per-node prolog entry: `setupRoot [opts] <imageType> <imageIdentifier>`.

use clap::Parser;
use udicore_lib::config::RuntimeConfig;
use udicore_lib::image_metadata::ImageMetadata;
use udicore_lib::mount_list::MountList;
use udicore_lib::orchestrator::{self, SetupRequest};
use udicore_lib::volume_map::VolumeMap;

/// Assemble the container root once, before any user task runs on this
/// node.
#[derive(Parser, Debug)]
#[command(name = "setupRoot")]
struct Args {
    /// Emit verbose diagnostics to stderr.
    #[arg(short = 'V', long = "verbose")]
    verbose: bool,

    /// `;`-separated site/user volume map.
    #[arg(short = 'v', long = "volume-map")]
    volume_map: Option<String>,

    /// SSH public key text to stage for this job (SSH launch itself is
    /// out of scope; only the value is threaded through).
    #[arg(short = 's', long = "ssh-pubkey")]
    ssh_pubkey: Option<String>,

    /// Target username.
    #[arg(short = 'u', long = "username")]
    username: String,

    /// Target uid.
    #[arg(short = 'U', long = "uid")]
    uid: u32,

    /// Target gid.
    #[arg(short = 'G', long = "gid")]
    gid: u32,

    /// Node spec: `host1/N1 host2/N2 ...`.
    #[arg(short = 'N', long = "node-spec")]
    nodespec: Option<String>,

    /// Image type, e.g. `docker`.
    image_type: String,

    /// Image identifier.
    image_identifier: String,
}

fn main() {
    udicore_utils::initialize_tracing();
    match run() {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("setupRoot: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing::debug!(image_type = %args.image_type, identifier = %args.image_identifier, "starting prolog");

    let mut config = RuntimeConfig::from_map(&Default::default());
    config.target_uid = args.uid;
    config.target_gid = args.gid;
    config.username = args.username.clone();
    config.ssh_pubkey = args.ssh_pubkey.clone();

    let (meta, unknown) = ImageMetadata::load(&config.image_base_path, &args.image_identifier)?;
    for key in unknown {
        tracing::warn!(key, "unrecognized image metadata key");
    }

    let user_volume_map = VolumeMap::parse(args.volume_map.as_deref().unwrap_or(""), false)?;
    let req = SetupRequest {
        image_identifier: args.image_identifier.clone(),
        username: args.username,
        uid: args.uid,
        gid: args.gid,
        aux_gids: Vec::new(),
        user_volume_map,
        nodespec: args.nodespec,
    };

    let mut mounts = MountList::parse()?;
    orchestrator::run_prolog(&mut config, &mut mounts, &req, &meta)?;
    Ok(())
}
