use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use pkg_runtime::{ProvisionerPaths, RuntimeProvisioner};
use pkg_supervisor::{LaunchSpec, ProcessRegistry, Supervisor, SupervisorConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ember-agent", about = "ember workload agent (runtime provisioning + supervision)")]
struct Cli {
    /// Application data directory holding packages/ and runtimes/
    #[arg(long, default_value = pkg_constants::paths::DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install a runtime version. A no-op when already installed.
    Provision {
        #[arg(long, default_value = pkg_constants::runtime::DEFAULT_RUNTIME_VERSION)]
        version: String,
    },
    /// Provision (if needed) and run a workload in the foreground.
    Run {
        /// Workload identifier
        #[arg(long)]
        id: String,

        /// Workload directory, becomes the process working directory
        #[arg(long)]
        dir: PathBuf,

        #[arg(long, default_value = pkg_constants::runtime::DEFAULT_RUNTIME_VERSION)]
        version: String,

        /// Server jar inside the workload directory
        #[arg(long, default_value = "server.jar")]
        jar: String,

        /// Heap ceiling in megabytes (-Xmx); the JVM default applies when unset
        #[arg(long)]
        memory_mb: Option<u32>,

        /// Extra arguments appended after the jar (e.g. `nogui`)
        #[arg(last = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let provisioner = RuntimeProvisioner::new(ProvisionerPaths::under(&cli.data_dir));
    match cli.command {
        Command::Provision { version } => {
            let root = provision(&provisioner, &version).await?;
            println!("runtime {} ready at {}", version, root.display());
            Ok(())
        }
        Command::Run {
            id,
            dir,
            version,
            jar,
            memory_mb,
            args,
        } => {
            let root = provision(&provisioner, &version).await?;
            let mut java_args = Vec::new();
            if let Some(mb) = memory_mb {
                java_args.push(format!("-Xmx{mb}M"));
            }
            java_args.push("-jar".to_string());
            java_args.push(jar);
            java_args.extend(args);

            let spec = LaunchSpec {
                executable: root.join("bin").join(pkg_constants::runtime::RUNTIME_ENTRYPOINT),
                args: java_args,
                working_dir: dir,
                env: HashMap::new(),
                runtime_root: root,
                host_lib_dirs: vec![],
            };
            run_workload(&id, &spec).await
        }
    }
}

async fn provision(provisioner: &RuntimeProvisioner, version: &str) -> Result<PathBuf> {
    if !pkg_constants::runtime::SUPPORTED_RUNTIME_VERSIONS.contains(&version) {
        bail!(
            "unsupported runtime version {version} (supported: {})",
            pkg_constants::runtime::SUPPORTED_RUNTIME_VERSIONS.join(", ")
        );
    }
    let root = provisioner
        .ensure_installed(version, |pct| info!("provisioning runtime {version}: {pct}%"))
        .await?;
    Ok(root)
}

/// Run one workload in the foreground: mirror its log stream to stdout,
/// forward our stdin lines to its console, stop gracefully on interrupt.
async fn run_workload(id: &str, spec: &LaunchSpec) -> Result<()> {
    let supervisor = Supervisor::new(ProcessRegistry::new(), SupervisorConfig::default());

    // Subscribe before starting so the startup lines are not missed.
    let (recent, mut live) = supervisor.log_stream(id).await;
    for line in recent {
        println!("{line}");
    }

    supervisor.start(id, spec).await?;

    let mut notifications = supervisor.notifications();
    tokio::spawn(async move {
        while let Ok(note) = notifications.recv().await {
            info!("workload {}: {:?}", note.workload_id, note.event);
        }
    });

    let mut usage = supervisor.usage_stream(id);
    {
        let id = id.to_string();
        tokio::spawn(async move {
            while usage.changed().await.is_ok() {
                let sample = *usage.borrow_and_update();
                debug!(
                    "usage {}: {}",
                    id,
                    serde_json::to_string(&sample).unwrap_or_default()
                );
            }
        });
    }

    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut liveness = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            line = live.recv() => match line {
                Ok(line) => println!("{line}"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("log stream lagged by {n} lines");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => supervisor.send_input(id, &line).await,
                // Detached console — keep running without input.
                _ => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received — stopping workload {id}");
                supervisor.stop(id).await;
                break;
            }
            _ = liveness.tick() => {
                if !supervisor.is_running(id).await {
                    info!("workload {id} exited");
                    break;
                }
            }
        }
    }
    Ok(())
}
