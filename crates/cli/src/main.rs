//! `promptq` -- command-line front end for a ComfyUI server.
//!
//! Read-only and control commands talk HTTP only; `submit` also opens the
//! push channel so it can follow the job it queued.
//!
//! # Environment variables
//!
//! | Variable                       | Required | Default                 |
//! |--------------------------------|----------|-------------------------|
//! | `COMFYUI_URL`                  | no       | `http://127.0.0.1:8188` |
//! | `COMFYUI_WS_URL`               | no       | derived from the URL    |
//! | `COMFYUI_REQUEST_TIMEOUT_SECS` | no       | unset                   |
//! | `COMFYUI_CONNECT_TIMEOUT_SECS` | no       | `10`                    |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use promptq_comfyui::{ClientConfig, ComfyClient, HttpTransport, JobOutcome};
use promptq_core::{DataOutput, Workflow, WorkflowGraph};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "promptq", version, about = "Queue and inspect ComfyUI jobs")]
struct Cli {
    /// Server base URL; overrides `COMFYUI_URL`.
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print server system stats.
    Stats,
    /// List past jobs.
    History {
        /// Sort by queue ordinal instead of server order.
        #[arg(long)]
        ordered: bool,
    },
    /// Queue an API-format workflow.
    Submit {
        /// API-format prompt JSON.
        workflow: PathBuf,
        /// Editor graph JSON to embed with the job.
        #[arg(long)]
        graph: Option<PathBuf>,
        /// Follow the job until it finishes.
        #[arg(long)]
        wait: bool,
    },
    /// Interrupt the running job.
    Interrupt,
    /// Remove every history entry.
    ClearHistory,
    /// Remove one history entry.
    Delete { prompt_id: String },
    /// Save the images of a finished job into a directory.
    Download { prompt_id: String, dir: PathBuf },
    /// List installed frontend extensions.
    Extensions,
    /// List available embeddings.
    Embeddings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "promptq=info,promptq_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::from_env()?;
    if let Some(url) = cli.url {
        config = ClientConfig {
            request_timeout: config.request_timeout,
            connect_timeout: config.connect_timeout,
            ..ClientConfig::new(url)
        };
    }

    run(config, cli.command).await
}

/// A client without a push connection, for commands that only need HTTP.
fn http_client(config: &ClientConfig) -> anyhow::Result<ComfyClient> {
    let transport = HttpTransport::new(&config.api_url, config.request_timeout)?;
    Ok(ComfyClient::with_transport(
        Arc::new(transport),
        "promptq-cli",
    ))
}

async fn run(config: ClientConfig, command: Command) -> anyhow::Result<()> {
    if let Command::Submit {
        workflow,
        graph,
        wait,
    } = command
    {
        return submit(config, &workflow, graph.as_deref(), wait).await;
    }

    let client = http_client(&config)?;
    match command {
        Command::Stats => print_json(&client.system_stats().await?)?,
        Command::History { ordered } => {
            let records = if ordered {
                client.history_ordered().await?
            } else {
                client.history().await?.into_values().collect()
            };
            for record in records {
                println!(
                    "{:>5}  {}  graph={}  images={}",
                    record.ordinal,
                    record.prompt_id,
                    record.graph.is_some(),
                    record.images().count(),
                );
            }
        }
        Command::Interrupt => client.interrupt().await?,
        Command::ClearHistory => client.clear_history().await?,
        Command::Delete { prompt_id } => client.delete_history_entry(&prompt_id).await?,
        Command::Download { prompt_id, dir } => download(&client, &prompt_id, &dir).await?,
        Command::Extensions => print_json(&client.extensions().await?)?,
        Command::Embeddings => print_json(&client.embeddings().await?)?,
        Command::Submit { .. } => {}
    }
    Ok(())
}

async fn submit(
    config: ClientConfig,
    workflow_path: &Path,
    graph_path: Option<&Path>,
    wait: bool,
) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(workflow_path)
        .await
        .with_context(|| format!("reading {}", workflow_path.display()))?;
    let mut workflow = Workflow::from_prompt_json(&text)
        .with_context(|| format!("{} is not an API-format prompt", workflow_path.display()))?;

    if let Some(path) = graph_path {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let graph: WorkflowGraph = serde_json::from_str(&text)
            .with_context(|| format!("{} is not a workflow graph", path.display()))?;
        workflow = workflow.with_graph(graph);
    }

    let client = ComfyClient::connect(config).await?;
    let job = client.submit(workflow).await?;
    println!("{}", job.prompt_id());

    if wait {
        let outcome = job.wait_for_completion().await;
        client.shutdown().await;
        return match outcome {
            JobOutcome::Completed { outputs } => {
                for (node, images) in outputs {
                    for image in images {
                        println!("{node}\t{}/{}", image.subfolder, image.filename);
                    }
                }
                Ok(())
            }
            JobOutcome::Failed {
                node_id,
                exception_type,
                message,
            } => anyhow::bail!("node {node_id} failed with {exception_type}: {message}"),
            JobOutcome::Interrupted { node_id } => {
                anyhow::bail!("job interrupted at node {}", node_id.unwrap_or_default())
            }
            JobOutcome::Abandoned => anyhow::bail!("push channel closed before the job finished"),
        };
    }

    client.shutdown().await;
    Ok(())
}

async fn download(client: &ComfyClient, prompt_id: &str, dir: &Path) -> anyhow::Result<()> {
    let record = client
        .history_entry(prompt_id)
        .await?
        .with_context(|| format!("no history entry for {prompt_id}"))?;

    for output in record.images() {
        let path = save_path(dir, output)?;
        let bytes = client.image(output).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "Saved image");
    }
    Ok(())
}

/// Where `output` is saved below `dir`; never outside it.
fn save_path(dir: &Path, output: &DataOutput) -> anyhow::Result<PathBuf> {
    let relative = output
        .local_path()
        .with_context(|| format!("unusable output filename {:?}", output.filename))?;
    Ok(dir.join(relative))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(subfolder: &str, filename: &str) -> DataOutput {
        DataOutput {
            filename: filename.into(),
            subfolder: subfolder.into(),
            kind: "output".into(),
        }
    }

    #[test]
    fn save_path_stays_inside_dir() {
        let dir = Path::new("/tmp/out");
        for (subfolder, filename) in [("", "/etc/passwd"), ("../..", "../x.png"), ("/abs", "a.png")] {
            let path = save_path(dir, &output(subfolder, filename)).unwrap();
            assert!(path.starts_with(dir), "{} escaped {}", path.display(), dir.display());
        }
    }

    #[test]
    fn same_name_in_different_subfolders_does_not_collide() {
        let dir = Path::new("out");
        let a = save_path(dir, &output("a", "img.png")).unwrap();
        let b = save_path(dir, &output("b", "img.png")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_filename_is_rejected() {
        assert!(save_path(Path::new("out"), &output("sub", "")).is_err());
    }
}
