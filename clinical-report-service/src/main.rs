use anyhow::Context as _;
use clap::Parser;
use clinical_report_service::services::{DocumentTextExtractor, PlainTextExtractor};
use clinical_report_service::{CdssConfig, ClinicalPipeline, PatientCase, PipelineKind};
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Turn a free-text patient note into a clinical decision support report.
#[derive(Debug, Parser)]
#[command(name = "clinical-report", version)]
struct Args {
    /// Patient note to read; stdin when omitted.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Extra document whose text is appended to the note.
    #[arg(long)]
    document: Option<PathBuf>,

    /// Session id to use instead of a generated one.
    #[arg(long)]
    session: Option<String>,

    /// Clinician feedback, applied in order after the first report.
    #[arg(long)]
    feedback: Vec<String>,
}

fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "clinical_report_service=info,flow_graph=info".into());

    // stdout carries the report
    match log_format.as_str() {
        "pretty" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    }
}

async fn read_note(input: Option<&PathBuf>) -> anyhow::Result<String> {
    match input {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display())),
        None => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("reading stdin")?;
            Ok(text)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = CdssConfig::from_env()?;
    if !args.feedback.is_empty() {
        config = config.with_pipeline(PipelineKind::Interactive);
    }

    let mut case = PatientCase::new(read_note(args.input.as_ref()).await?);
    if let Some(path) = &args.document {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        case = case.with_document_text(PlainTextExtractor.extract(&bytes)?);
    }
    if let Some(session_id) = args.session {
        case = case.with_session_id(session_id);
    }
    if case.text().trim().is_empty() {
        anyhow::bail!("the patient note is empty");
    }

    let pipeline = ClinicalPipeline::new(config)?;
    info!(
        session_id = %case.session_id,
        cache_dir = %pipeline.config().cache_dir.display(),
        "Running clinical pipeline"
    );
    let session_id = case.session_id.clone();
    let report = pipeline.run_case(case).await?;
    println!("{report}");

    for feedback in &args.feedback {
        let report = pipeline.submit_feedback(&session_id, feedback).await?;
        println!("{report}");
    }
    if !args.feedback.is_empty() {
        pipeline.release(&session_id).await?;
    }

    Ok(())
}
