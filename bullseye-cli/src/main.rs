mod cli;
mod output;

use anyhow::{Context, bail};
use bullseye::config::CLOUD_MODELS;
use bullseye::model::FindingFilter;
use bullseye::{JobStatus, Orchestrator, Settings, SubmitRequest};
use clap::Parser;
use futures::StreamExt;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, LogFormat};
use output::{AnalysisOutput, OutputFormatter, formatter, progress_line};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_tracing(&args);

    let settings = args.settings()?;
    match args.command {
        Command::Serve { .. } => serve(settings).await,
        Command::Analyze {
            repo,
            branch,
            model,
            name,
            api_keys,
            json,
        } => {
            let request = SubmitRequest {
                repo_url: cli::repo_locator(&repo)?,
                branch,
                name,
                model,
                api_keys,
            };
            analyze(settings, request, json).await
        }
        Command::Models { json } => models(&settings, json),
    }
}

fn init_tracing(args: &Cli) {
    let filter = EnvFilter::builder()
        .with_default_directive(args.verbose.tracing_level_filter().into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match args.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let bind = settings.api.bind.clone();
    let orchestrator = Orchestrator::builder(settings).build().await?;
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    bullseye::api::serve(listener, orchestrator.clone(), shutdown_signal()).await?;
    orchestrator.shutdown().await;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}

async fn analyze(settings: Settings, request: SubmitRequest, json: bool) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::builder(settings).build().await?;
    let job = orchestrator.submit(request).await?;
    eprintln!("job {} submitted", job.id);

    let mut events = orchestrator.watch(job.id).await?;
    let mut stopping = false;
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => eprintln!("{}", progress_line(&event)),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                eprintln!("stopping job {}", job.id);
                orchestrator.stop(job.id).await?;
            }
        }
    }

    let job = orchestrator.job(job.id).await?;
    let summary = orchestrator.findings_summary(job.id).await?;
    let findings = orchestrator.findings(job.id, &FindingFilter::default()).await?;
    let report = orchestrator.report(job.id).await.ok();

    let results = AnalysisOutput {
        job: &job,
        summary: &summary,
        findings: &findings,
        report: report.as_ref().map(|r| r.content.as_str()),
    };
    let stdout = std::io::stdout();
    formatter(json).write_results(&results, &mut stdout.lock())?;

    match job.status {
        JobStatus::Completed => Ok(()),
        JobStatus::Cancelled => bail!("analysis cancelled"),
        _ => bail!(
            "analysis failed: {}",
            job.error_message.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn models(settings: &Settings, json: bool) -> anyhow::Result<()> {
    let models = settings.permitted_models();
    if json {
        let body = serde_json::json!({
            "default": settings.default_model,
            "models": models,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    for id in &models {
        let marker = if *id == settings.default_model { "*" } else { " " };
        match CLOUD_MODELS.iter().find(|(known, _)| *known == id.as_str()) {
            Some((_, label)) => println!("{marker} {id}\t{label}"),
            None => println!("{marker} {id}"),
        }
    }
    Ok(())
}
