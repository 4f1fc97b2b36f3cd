//! Terminal rendering of stream events and session statistics.

use std::io::{self, Write};

use chrono::Utc;
use tokio::sync::mpsc;

use medex_runtime::{SessionStatsSnapshot, StreamEvent};

const RULE: &str = "────────────────────────────────────────────────────────────";

/// Print events as they arrive until the sender side closes.
pub(crate) async fn print_events(mut rx: mpsc::Receiver<StreamEvent>) {
    let mut printer = EventPrinter::default();
    let mut stdout = io::stdout();
    while let Some(event) = rx.recv().await {
        let text = printer.render(&event);
        if !text.is_empty() {
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        }
    }
}

/// Tracks whether the reasoning section is open so headers print once per
/// switch between reasoning and answer text.
#[derive(Debug, Default)]
pub(crate) struct EventPrinter {
    in_reasoning: bool,
}

impl EventPrinter {
    pub(crate) fn render(&mut self, event: &StreamEvent) -> String {
        match event {
            StreamEvent::Reasoning(text) => {
                if self.in_reasoning {
                    text.clone()
                } else {
                    self.in_reasoning = true;
                    format!("🧠 Razonamiento:\n{text}")
                }
            }
            StreamEvent::Token(text) => {
                if self.in_reasoning {
                    self.in_reasoning = false;
                    format!("\n{RULE}\n{text}")
                } else {
                    text.clone()
                }
            }
            StreamEvent::ToolCallStart(info) => {
                self.in_reasoning = false;
                format!("\n🔍 {}: {}\n", info.name, info.args)
            }
            StreamEvent::ToolCallEnd(result) if !result.success => {
                format!("⚠️  {} falló: {}\n", result.name, result.output)
            }
            StreamEvent::ToolCallEnd(_) => String::new(),
            StreamEvent::Done => format!("\n{RULE}\n"),
            // Errors are reported by the caller from the returned `Result`.
            StreamEvent::Error(_) => String::new(),
        }
    }
}

pub(crate) fn format_stats(stats: &SessionStatsSnapshot, conversations: usize, model: &str) -> String {
    let uptime = (Utc::now() - stats.started_at).num_seconds().max(0);
    format!(
        "📊 Estadísticas de la sesión\n\
         - consultas: {}\n\
         - emergencias: {}\n\
         - profesionales: {}\n\
         - pacientes: {}\n\
         - imágenes analizadas: {}\n\
         - conversaciones en memoria: {conversations}\n\
         - modelo: {model}\n\
         - duración: {uptime}s",
        stats.queries,
        stats.emergencies,
        stats.professional_queries,
        stats.patient_queries,
        stats.images_analyzed,
    )
}
