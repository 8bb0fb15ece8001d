//! Deployer - Entry Point
//!
//! Self-hosted deployment orchestrator: clones a project's repository,
//! builds an isolated release, switches it live under a process supervisor
//! and a reverse proxy, and rolls back when it does not come up healthy.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use secrecy::SecretString;
use serde::Serialize;
use tracing::{info, warn};

use deploy_api::{DeployRequest, ErrorResponse, RollbackRequest, TriggerRequest};
use deployer::app::options::AppOptions;
use deployer::app::run::run;
use deployer::app::state::AppState;
use deployer::app::trigger;
use deployer::errors::DeployerError;
use deployer::filesys::file::File;
use deployer::logs::{init_logging, LogOptions};
use deployer::manage::{self, Registration};
use deployer::models::deployment::{Deployment, DeploymentStatus};
use deployer::storage::settings::Settings;
use deployer::utils::version_info;

#[derive(Debug, Parser)]
#[command(name = "deployer", about = "Self-hosted deployment orchestrator")]
struct Cli {
    /// Settings file
    #[arg(
        long,
        global = true,
        env = "DEPLOYER_SETTINGS",
        default_value = "/etc/deployer/settings.json"
    )]
    settings: PathBuf,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Deploy a commit (default: branch tip) to an environment
    Deploy {
        project: String,
        environment: String,
        #[arg(long)]
        commit: Option<String>,
        #[arg(long, env = "USER", default_value = "cli")]
        initiator: String,
    },

    /// Roll an environment back to its previous release
    Rollback {
        project: String,
        environment: String,
        #[arg(long, env = "USER", default_value = "cli")]
        initiator: String,
    },

    /// Register a project and its environments
    RegisterProject {
        #[arg(long)]
        name: String,
        #[arg(long)]
        repo_url: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long, default_value_t = 8000)]
        start_port: u16,
        /// Private key used to clone the repository
        #[arg(long)]
        deploy_key_file: Option<PathBuf>,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, value_delimiter = ',', default_value = "qa,stage,prod")]
        environments: Vec<String>,
    },

    /// Disable a project, keeping its history
    DeregisterProject { name: String },

    /// Set an encrypted environment secret
    SetSecret {
        project: String,
        environment: String,
        key: String,
        value: String,
    },

    /// Remove an environment secret
    UnsetSecret {
        project: String,
        environment: String,
        key: String,
    },

    /// List the secret names of an environment
    Secrets { project: String, environment: String },

    /// Set or clear the domain of an environment
    SetDomain {
        project: String,
        environment: String,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        ssl: bool,
    },

    /// Recent deployments and services of an environment
    Status {
        project: String,
        environment: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Log stream of a deployment
    Logs { deployment_id: i64 },

    /// Mark the in-flight deployment of an environment failed
    CleanupDeployment { project: String, environment: String },

    /// Run the reaper and health monitor until SIGINT or SIGTERM
    Daemon,

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        let version = version_info();
        println!(
            "deployer {} ({}, built {})",
            version.version, version.git_hash, version.build_time
        );
        return ExitCode::SUCCESS;
    }

    let settings = match Settings::load(&File::new(&cli.settings)).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} unable to read settings file: {}", "error:".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
        json_format: settings.json_logs,
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let json = cli.json;
    match execute(cli, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                print_json(&ErrorResponse::from(e));
            } else {
                eprintln!("{} {}", "error:".red().bold(), e);
            }
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli, settings: Settings) -> Result<(), DeployerError> {
    let options = AppOptions::from(&settings);
    let state = Arc::new(AppState::init(settings).await?);
    let json = cli.json;

    match cli.command {
        Command::Deploy {
            project,
            environment,
            commit,
            initiator,
        } => {
            let request = TriggerRequest::Deploy(DeployRequest {
                project: project.clone(),
                environment: environment.clone(),
                commit,
                initiator,
            });
            let deployment = trigger::dispatch(&state.executor, request).await?;
            report_deployment(json, &project, &environment, &deployment);
        }

        Command::Rollback {
            project,
            environment,
            initiator,
        } => {
            let request = TriggerRequest::Rollback(RollbackRequest {
                project: project.clone(),
                environment: environment.clone(),
                initiator,
            });
            let deployment = trigger::dispatch(&state.executor, request).await?;
            report_deployment(json, &project, &environment, &deployment);
        }

        Command::RegisterProject {
            name,
            repo_url,
            branch,
            start_port,
            deploy_key_file,
            description,
            environments,
        } => {
            let deploy_key = match deploy_key_file {
                Some(path) => Some(SecretString::from(File::new(path).read_string().await?)),
                None => None,
            };
            let (project, envs) = manage::register_project(
                &state.store,
                &state.secrets,
                Registration {
                    name,
                    repo_url,
                    branch,
                    start_port,
                    deploy_key,
                    description,
                    environments,
                },
            )
            .await?;

            if json {
                print_json(&serde_json::json!({
                    "project": project,
                    "environments": envs,
                    "webhook_secret": project.webhook_secret,
                }));
            } else {
                println!("{} {}", "Registered".green().bold(), project.name.bold());
                println!("  repository:     {} ({})", project.repo_url, project.branch);
                println!("  start port:     {}", project.start_port);
                println!("  deploy key:     {}", if project.deploy_key.is_some() { "yes" } else { "no" });
                let names: Vec<&str> = envs.iter().map(|e| e.name.as_str()).collect();
                println!("  environments:   {}", names.join(", "));
                println!("  webhook secret: {}", project.webhook_secret);
            }
        }

        Command::DeregisterProject { name } => {
            let project = manage::deregister_project(&state.store, &name).await?;
            if json {
                print_json(&project);
            } else {
                println!("{} {}", "Deregistered".yellow().bold(), project.name);
            }
        }

        Command::SetSecret {
            project,
            environment,
            key,
            value,
        } => {
            manage::set_secret(
                &state.store,
                &state.secrets,
                &project,
                &environment,
                &key,
                SecretString::from(value),
            )
            .await?;
            if json {
                print_json(&serde_json::json!({ "key": key, "set": true }));
            } else {
                println!("Secret {} set for {}/{}", key.bold(), project, environment);
            }
        }

        Command::UnsetSecret {
            project,
            environment,
            key,
        } => {
            let removed =
                manage::unset_secret(&state.store, &state.secrets, &project, &environment, &key)
                    .await?;
            if json {
                print_json(&serde_json::json!({ "key": key, "removed": removed }));
            } else if removed {
                println!("Secret {} removed from {}/{}", key.bold(), project, environment);
            } else {
                println!("Secret {} was not set for {}/{}", key, project, environment);
            }
        }

        Command::Secrets {
            project,
            environment,
        } => {
            let names =
                manage::secret_names(&state.store, &state.secrets, &project, &environment).await?;
            if json {
                print_json(&names);
            } else if names.is_empty() {
                println!("No secrets set for {}/{}", project, environment);
            } else {
                for name in names {
                    println!("{}", name);
                }
            }
        }

        Command::SetDomain {
            project,
            environment,
            domain,
            ssl,
        } => {
            let env =
                manage::set_domain(&state.store, &project, &environment, domain.as_deref(), ssl)
                    .await?;
            if json {
                print_json(&env);
            } else {
                match &env.domain {
                    Some(domain) => println!(
                        "{}/{} served at {}{}",
                        project,
                        environment,
                        domain.bold(),
                        if env.ssl_enabled { " (TLS)" } else { "" }
                    ),
                    None => println!("Domain cleared for {}/{}", project, environment),
                }
            }
        }

        Command::Status {
            project,
            environment,
            limit,
        } => {
            let status = manage::status(&state.store, &project, &environment, limit).await?;
            if json {
                let views: Vec<_> = status
                    .deployments
                    .iter()
                    .map(|d| d.to_view(&project, &environment))
                    .collect();
                print_json(&serde_json::json!({
                    "deployments": views,
                    "services": status.services,
                }));
            } else {
                println!("{}", format!("{}/{}", project, environment).bold());
                println!("\nDeployments:");
                if status.deployments.is_empty() {
                    println!("  (none)");
                }
                for d in &status.deployments {
                    println!(
                        "  #{:<5} {:<28} {:<12} {:<10} {}",
                        d.id,
                        d.version,
                        colored_status(d.status),
                        d.commit_sha.as_deref().map(|s| &s[..s.len().min(8)]).unwrap_or("-"),
                        d.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                println!("\nServices:");
                if status.services.is_empty() {
                    println!("  (none)");
                }
                for s in &status.services {
                    println!(
                        "  {:<20} {:<10} {:<8} port {:<6} restarts {}",
                        s.name,
                        s.service_type.to_string(),
                        s.status.to_string(),
                        s.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                        s.restart_count
                    );
                }
            }
        }

        Command::Logs { deployment_id } => {
            let logs = manage::deployment_logs(&state.store, deployment_id).await?;
            if json {
                let entries: Vec<deploy_api::LogEntryView> =
                    logs.entries.into_iter().map(Into::into).collect();
                print_json(&serde_json::json!({
                    "deployment": logs.deployment.to_view(&logs.project, &logs.environment),
                    "logs": entries,
                }));
            } else {
                println!(
                    "{} {} of {}/{} ({})",
                    "Deployment".bold(),
                    logs.deployment.version,
                    logs.project,
                    logs.environment,
                    colored_status(logs.deployment.status)
                );
                for entry in &logs.entries {
                    let level = match entry.level.as_str() {
                        "ERROR" => entry.level.as_str().red(),
                        "WARNING" => entry.level.as_str().yellow(),
                        "DEBUG" => entry.level.as_str().dimmed(),
                        other => other.normal(),
                    };
                    println!(
                        "{} {:<7} {}",
                        entry.created_at.format("%H:%M:%S"),
                        level,
                        entry.message
                    );
                }
            }
        }

        Command::CleanupDeployment {
            project,
            environment,
        } => {
            let deployment = state
                .executor
                .cleanup_in_flight(&project, &environment)
                .await?;
            report_deployment(json, &project, &environment, &deployment);
        }

        Command::Daemon => {
            info!("Running deployer daemon with options: {:?}", options);
            run(state, options, await_shutdown_signal()).await?;
        }

        Command::Version => {}
    }
    Ok(())
}

fn report_deployment(json: bool, project: &str, environment: &str, deployment: &Deployment) {
    if json {
        print_json(&deployment.to_view(project, environment));
        return;
    }
    println!(
        "{} {} of {}/{} is {}",
        if deployment.is_rollback() { "Rollback" } else { "Deployment" },
        deployment.version.bold(),
        project,
        environment,
        colored_status(deployment.status)
    );
    if let Some(error) = &deployment.error_message {
        println!("  {}", error.red());
    }
}

fn colored_status(status: DeploymentStatus) -> ColoredString {
    match status {
        DeploymentStatus::Active => status.as_str().green().bold(),
        DeploymentStatus::Failed => status.as_str().red().bold(),
        DeploymentStatus::RolledBack => status.as_str().yellow(),
        DeploymentStatus::Inactive => status.as_str().dimmed(),
        _ => status.as_str().cyan(),
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, shutting down...");
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received, shutting down...");
                    }
                }
            }
            _ => {
                warn!("Unable to install signal handlers, waiting for Ctrl+C");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
