//! `tessera run` -- one task, streamed to stdout.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{json, Value};
use tessera_core::{
    DispatchSettings, LoadProgress, OutboundMessage, Outbox, TaskDispatcher, TaskKind, TaskOutput,
    WorkerConfig,
};
use tokio::sync::mpsc::UnboundedReceiver;

/// Sampling flags; unset ones keep the worker defaults.
#[derive(Args, Debug, Default)]
pub struct GenerationArgs {
    /// Sampling temperature (0 = no scaling).
    #[arg(long)]
    pub temperature: Option<f64>,

    /// Beam count; more than one selects beam search.
    #[arg(long)]
    pub num_beams: Option<usize>,

    /// Restrict sampling to the k best tokens.
    #[arg(long)]
    pub top_k: Option<usize>,

    /// Sample instead of taking the best token.
    #[arg(long)]
    pub do_sample: bool,

    /// Maximum tokens to generate.
    #[arg(long)]
    pub max_new_tokens: Option<usize>,

    /// RNG seed for reproducible sampling.
    #[arg(long)]
    pub seed: Option<u64>,
}

pub struct TaskArgs {
    pub task: TaskKind,
    pub text: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub question: Option<String>,
    pub context: Option<String>,
    pub generation: GenerationArgs,
}

impl TaskArgs {
    /// The host message this invocation stands for.
    pub fn to_message(&self) -> Value {
        let g = &self.generation;
        let mut generation = json!({ "doSample": g.do_sample });
        let knobs = [
            ("temperature", g.temperature.map(Value::from)),
            ("numBeams", g.num_beams.map(Value::from)),
            ("topK", g.top_k.map(Value::from)),
            ("maxNewTokens", g.max_new_tokens.map(Value::from)),
            ("seed", g.seed.map(Value::from)),
        ];
        for (key, value) in knobs {
            if let Some(value) = value {
                generation[key] = value;
            }
        }

        json!({
            "task": self.task,
            "text": self.text,
            "languageFrom": self.from,
            "languageTo": self.to,
            "question": self.question,
            "context": self.context,
            "elementIdToUpdate": "stdout",
            "generation": generation,
        })
    }
}

pub async fn execute(config: WorkerConfig, args: TaskArgs) -> Result<()> {
    let cache = super::resource_cache(&config)?;
    let settings = DispatchSettings {
        report_failures: true,
        ..DispatchSettings::from(&config)
    };
    let (outbox, outgoing) = Outbox::channel();
    let dispatcher = Arc::new(TaskDispatcher::new(cache, outbox, settings));

    let t_start = Instant::now();
    let message = args.to_message();
    let dispatch = async move { dispatcher.dispatch(message).await };
    let print = async {
        let mut stdout = std::io::stdout().lock();
        render(outgoing, &mut stdout)
            .await
    };
    let ((), output) = tokio::join!(dispatch, print);
    let output = output?;

    if output.as_text().is_none() {
        println!("{}", serde_json::to_string_pretty(&output)?);
    }
    eprintln!();
    eprintln!("--- {} finished in {:.2}s ---", args.task, t_start.elapsed().as_secs_f64());
    Ok(())
}

/// Prints streamed text as it grows, only writing what is new.
#[derive(Default)]
struct StreamPrinter {
    printed: String,
}

impl StreamPrinter {
    fn show(&mut self, text: &str, out: &mut impl Write) -> Result<()> {
        match text.strip_prefix(self.printed.as_str()) {
            Some(suffix) => write!(out, "{suffix}")?,
            // Decoding can rewrite earlier text; start a fresh line.
            None => write!(out, "\n{text}")?,
        }
        out.flush()?;
        self.printed = text.to_string();
        Ok(())
    }
}

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Drain the outbound stream until the terminal message.
async fn render(
    mut outgoing: UnboundedReceiver<OutboundMessage>,
    out: &mut impl Write,
) -> Result<TaskOutput> {
    let mut printer = StreamPrinter::default();
    let mut progress: Option<ProgressBar> = None;

    while let Some(message) = outgoing.recv().await {
        match message {
            OutboundMessage::Download { data, .. } => {
                let pb = progress.get_or_insert_with(spinner);
                match data {
                    LoadProgress::Initiate { name, file } => {
                        pb.set_message(format!("Fetching {file} from {name}..."))
                    }
                    LoadProgress::Done { name, file } => {
                        pb.set_message(format!("Fetched {file} from {name}, loading..."))
                    }
                    LoadProgress::Ready { name } => {
                        pb.finish_with_message(format!("Model ready: {name}"))
                    }
                }
            }
            OutboundMessage::Update { data, .. } => {
                if let Some(pb) = progress.take() {
                    pb.finish_and_clear();
                }
                printer.show(&data, out)?;
            }
            OutboundMessage::Result { data, .. } => {
                if let Some(text) = data.as_text() {
                    printer.show(text, out)?;
                    writeln!(out)?;
                }
                return Ok(data);
            }
            OutboundMessage::Error { data, .. } => bail!(data),
        }
    }
    bail!("worker stopped without a result")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::mock;

    #[test]
    fn printer_writes_only_new_text() {
        let mut out = Vec::new();
        let mut printer = StreamPrinter::default();
        printer.show("bonjour", &mut out).unwrap();
        printer.show("bonjour le", &mut out).unwrap();
        printer.show("bonjour le monde", &mut out).unwrap();
        printer.show("bonjour le monde", &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "bonjour le monde");
    }

    #[test]
    fn printer_restarts_when_text_is_rewritten() {
        let mut out = Vec::new();
        let mut printer = StreamPrinter::default();
        printer.show("bonjour", &mut out).unwrap();
        printer.show("salut", &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "bonjour\nsalut");
    }

    #[test]
    fn message_carries_only_given_knobs() {
        let args = TaskArgs {
            task: TaskKind::Translation,
            text: Some("hello".into()),
            from: Some("en".into()),
            to: Some("fr".into()),
            question: None,
            context: None,
            generation: GenerationArgs {
                num_beams: Some(3),
                ..Default::default()
            },
        };
        let message = args.to_message();
        assert_eq!(message["task"], "translation");
        assert_eq!(message["languageTo"], "fr");
        assert_eq!(message["generation"], json!({ "doSample": false, "numBeams": 3 }));
    }

    #[tokio::test]
    async fn render_returns_the_terminal_result() {
        let (outbox, outgoing) = Outbox::channel();
        let dispatcher = TaskDispatcher::new(mock::cache(), outbox, DispatchSettings::default());
        let args = TaskArgs {
            task: TaskKind::Translation,
            text: Some("hello world".into()),
            from: Some("en".into()),
            to: Some("fr".into()),
            question: None,
            context: None,
            generation: GenerationArgs {
                temperature: Some(0.0),
                ..Default::default()
            },
        };
        dispatcher.dispatch(args.to_message()).await;

        let mut out = Vec::new();
        let output = render(outgoing, &mut out).await.unwrap();
        assert_eq!(output, TaskOutput::Text("bonjour le monde".into()));
        assert_eq!(String::from_utf8(out).unwrap(), "bonjour le monde\n");
    }

    #[tokio::test]
    async fn render_surfaces_errors() {
        let (outbox, outgoing) = Outbox::channel();
        outbox.post(OutboundMessage::Error {
            task: TaskKind::Summarization,
            target: None,
            data: "no model source registered".into(),
        });
        let err = render(outgoing, &mut Vec::new()).await.unwrap_err();
        assert!(err.to_string().contains("no model source"));
    }
}
