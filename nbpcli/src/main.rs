use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use nbp::{initiators, Config, ConnectionDescriptor, Mounter, SessionManager};

#[derive(Parser, Debug)]
#[command(name = "nbpcli", version, about = "Attach iSCSI volumes and prepare them for use")]
struct Cli {
    /// yaml configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in to a target and print the local device path
    Connect {
        #[arg(long)]
        portal: String,
        #[arg(long)]
        iqn: String,
        #[arg(long, default_value_t = 0)]
        lun: u32,
        #[arg(long, default_value = "")]
        auth_method: String,
        #[arg(long, default_value = "")]
        auth_user: String,
        #[arg(long, default_value = "", env = "NBP_AUTH_PASSWORD")]
        auth_password: String,
    },
    /// Log out of a target and delete its node record
    Disconnect {
        #[arg(long)]
        portal: String,
        #[arg(long)]
        iqn: String,
    },
    /// Format the device if it has no filesystem, then mount it
    FormatMount {
        #[arg(long)]
        device: String,
        #[arg(long, default_value = "")]
        fs_type: String,
        #[arg(long)]
        mount_point: String,
    },
    Umount {
        #[arg(long)]
        mount_point: String,
    },
    /// Print the initiator names of this host
    Initiator,
    /// Print the effective configuration as yaml
    Config,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => Config::read(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Connect {
            portal,
            iqn,
            lun,
            auth_method,
            auth_user,
            auth_password,
        } => {
            let desc = ConnectionDescriptor::new(portal, iqn, lun).with_chap(
                auth_method,
                auth_user,
                auth_password,
            );
            let device = SessionManager::host(cfg.iscsi()).connect(&desc)?;
            println!("{}", device);
        }
        Commands::Disconnect { portal, iqn } => {
            SessionManager::host(cfg.iscsi()).disconnect(portal, iqn)?;
        }
        Commands::FormatMount {
            device,
            fs_type,
            mount_point,
        } => {
            Mounter::host(cfg.volume()).format_and_mount(&device, &fs_type, &mount_point)?;
            info!("{} is mounted on {}", device, mount_point);
        }
        Commands::Umount { mount_point } => {
            Mounter::host(cfg.volume()).umount(&mount_point)?;
        }
        Commands::Initiator => {
            for iqn in initiators(cfg.iscsi().initiator_file()) {
                println!("{}", iqn);
            }
        }
        Commands::Config => {
            print!("{}", cfg.to_yml()?);
        }
    }

    Ok(())
}
