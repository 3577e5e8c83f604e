use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use k8s_provisioner::config::loader::load_settings;
use k8s_provisioner::credentials::materialize;
use k8s_provisioner::log_collector::{init_global_logger, parse_level};
use k8s_provisioner::orchestrator::build_phase_plan;
use k8s_provisioner::{
    build_inventory, AgeDecryptor, AnsibleRunner, Job, JobContext, JobStore, JobType,
    JsonFileStore, LogCollector, PlaintextDecryptor, SecretDecryptor, Settings, WorkerPool,
};

#[derive(Parser)]
#[command(name = "k8s-provisioner", version, about = "Provision Kubernetes clusters phase by phase")]
struct Cli {
    /// Settings file (defaults to ~/.config/k8s-provisioner/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a provision job for a cluster and wait for it to finish
    Provision {
        #[arg(long)]
        cluster: Uuid,
        /// Reuse an existing queued job instead of creating one
        #[arg(long)]
        job: Option<Uuid>,
    },
    /// Print the phase plan for a cluster without running it
    Plan {
        #[arg(long)]
        cluster: Uuid,
    },
    /// Print the rendered inventory for a cluster with secrets masked
    Inventory {
        #[arg(long)]
        cluster: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.settings.as_deref()).context("Failed to load settings")?;

    let log_collector = LogCollector::new(settings.log_dir.clone(), parse_level(&settings.log_level))
        .map_err(anyhow::Error::msg)
        .context("LogCollector initialization failed")?
        .with_stderr_echo(true);
    if let Err(e) = init_global_logger(&log_collector) {
        eprintln!("[Main] WARNING: Failed to set LogCollector as global logger: {}", e);
    }
    log::info!("[Main] k8s-provisioner {} starting", k8s_provisioner::VERSION);

    let store = Arc::new(
        JsonFileStore::open(settings.data_dir.clone())
            .await
            .context("Failed to open data directory")?,
    );
    let decryptor = decryptor_for(&settings)?;

    let result = match cli.command {
        Command::Provision { cluster, job } => {
            provision(&settings, store, decryptor, log_collector.clone(), cluster, job).await
        }
        Command::Plan { cluster } => print_plan(&settings, store.as_ref(), cluster).await,
        Command::Inventory { cluster } => {
            print_inventory(store.as_ref(), decryptor.as_ref(), cluster).await
        }
    };

    let _ = log_collector.wait_for_empty().await;
    result
}

fn decryptor_for(settings: &Settings) -> anyhow::Result<Arc<dyn SecretDecryptor>> {
    match &settings.age_identity_path {
        Some(path) => {
            let decryptor = AgeDecryptor::from_identity_file(path)
                .with_context(|| format!("Failed to load age identity {}", path.display()))?;
            Ok(Arc::new(decryptor))
        }
        None => {
            log::warn!("[Main] No age identity configured; stored secrets are read as plaintext");
            Ok(Arc::new(PlaintextDecryptor))
        }
    }
}

async fn provision(
    settings: &Settings,
    store: Arc<JsonFileStore>,
    decryptor: Arc<dyn SecretDecryptor>,
    log_collector: LogCollector,
    cluster_id: Uuid,
    job_id: Option<Uuid>,
) -> anyhow::Result<()> {
    store
        .load_cluster(cluster_id)
        .await
        .with_context(|| format!("Cannot provision cluster {}", cluster_id))?;

    let job_id = match job_id {
        Some(id) => {
            let job = store.load_job(id).await?;
            if job.cluster_id != cluster_id {
                bail!("Job {} belongs to cluster {}", id, job.cluster_id);
            }
            id
        }
        None => {
            let job = Job::new(cluster_id, JobType::Provision);
            store.save_job(&job).await?;
            log::info!("[Main] Created job {} for cluster {}", job.id, cluster_id);
            job.id
        }
    };

    let ctx = Arc::new(JobContext {
        store: store.clone(),
        decryptor,
        runner: Arc::new(AnsibleRunner::new(
            settings.ansible_binary.clone(),
            settings.playbooks_path.clone(),
        )),
        settings: settings.clone(),
        log_collector: Some(log_collector),
    });
    let pool = WorkerPool::start(ctx, settings.max_concurrent_jobs);
    log::info!("[Main] Worker pool started with {} workers", pool.workers());
    let handle = pool.submit(job_id).await?;

    let canceller = handle.canceller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("[Main] Interrupt received, cancelling after the current phase");
            let _ = canceller.send(true);
        }
    });

    let outcome = handle.outcome().await;
    pool.shutdown().await;

    let Some(outcome) = outcome else {
        bail!("Job {} was dropped by the worker pool", job_id);
    };
    println!("Job {}: {}", outcome.job_id, outcome.message);
    if !outcome.success {
        let status = outcome
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "not started".to_string());
        bail!("Job {} ended {}", outcome.job_id, status);
    }
    Ok(())
}

async fn print_plan(settings: &Settings, store: &dyn JobStore, cluster_id: Uuid) -> anyhow::Result<()> {
    let snapshot = store.load_cluster(cluster_id).await?;
    let components = settings.plan_defaults().resolve(&snapshot.cluster)?;
    let plan = build_phase_plan(&snapshot.cluster, &components)?;
    println!("Phase plan for cluster '{}':", snapshot.cluster.name);
    for (index, phase) in plan.iter().enumerate() {
        println!("{:>2}. {:<38} {}", index + 1, phase.name, phase.playbook);
    }
    Ok(())
}

async fn print_inventory(
    store: &dyn JobStore,
    decryptor: &dyn SecretDecryptor,
    cluster_id: Uuid,
) -> anyhow::Result<()> {
    let snapshot = store.load_cluster(cluster_id).await?;
    let secrets = materialize(cluster_id, snapshot.credential.as_ref(), decryptor)?;
    let inventory = build_inventory(&snapshot.nodes, &secrets, Some(Path::new("<job-dir>/id_ssh")))?;
    print!("{}", inventory.render(true));
    Ok(())
}
