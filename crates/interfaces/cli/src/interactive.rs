use std::io::{self, Write};
use std::path::Path;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use medex_runtime::{MedexRuntime, OrchestratorError, RuntimeError, classifier};

use crate::render;

/// One parsed line of REPL input.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Command<'a> {
    Empty,
    Exit,
    Help,
    Stats,
    Clear,
    Image { path: &'a str, context: &'a str },
    Json(&'a str),
    Usage(&'static str),
    Ask(&'a str),
}

pub(crate) fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }

    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };

    // Bare-word aliases count only when they are the whole line.
    let bare = rest.is_empty();
    match head.to_lowercase().as_str() {
        "/exit" | "/quit" => Command::Exit,
        "salir" | "exit" | "quit" if bare => Command::Exit,
        "/help" => Command::Help,
        "ayuda" if bare => Command::Help,
        "/stats" => Command::Stats,
        "estado" if bare => Command::Stats,
        "/clear" => Command::Clear,
        "limpiar" if bare => Command::Clear,
        "/image" | "/imagen" => {
            if rest.is_empty() {
                return Command::Usage("/image <ruta> [contexto clínico]");
            }
            let (path, context) = match rest.split_once(char::is_whitespace) {
                Some((path, context)) => (path, context.trim()),
                None => (rest, ""),
            };
            Command::Image { path, context }
        }
        "/json" => {
            if rest.is_empty() {
                Command::Usage("/json <consulta>")
            } else {
                Command::Json(rest)
            }
        }
        _ => Command::Ask(line),
    }
}

fn print_help() {
    println!("Comandos:");
    println!("  /image <ruta> [contexto]  analizar una imagen médica");
    println!("  /json <consulta>          diagnóstico estructurado en JSON");
    println!("  /stats | estado           estadísticas de la sesión");
    println!("  /clear | limpiar          borrar el historial de conversación");
    println!("  /help  | ayuda            mostrar esta ayuda");
    println!("  /exit  | salir            terminar la sesión");
    println!("Ctrl-C durante una respuesta la cancela.");
}

pub(crate) async fn run_interactive_session(runtime: &MedexRuntime) -> Result<()> {
    let config = runtime.config();
    println!("🏥 {} - asistente médico ({})", config.agent.name, config.llm.model);
    println!("⚠️  Información educativa: no sustituye la consulta con un profesional de salud.");
    println!("🚨 En una emergencia llame al 911 o acuda al servicio de urgencias más cercano.");
    println!("Escriba /help para ver los comandos.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n👤 > ");
        io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };

        match parse_command(&line) {
            Command::Empty => continue,
            Command::Exit => break,
            Command::Help => print_help(),
            Command::Usage(usage) => println!("uso: {usage}"),
            Command::Stats => {
                let snapshot = runtime.stats();
                let conversations = runtime.history_len().await;
                println!(
                    "{}",
                    render::format_stats(&snapshot, conversations, &runtime.config().llm.model)
                );
            }
            Command::Clear => {
                runtime.clear_history().await;
                println!("🧹 Historial limpiado");
            }
            Command::Image { path, context } => {
                if let Err(err) = analyze_image(runtime, Path::new(path), context).await {
                    eprintln!("❌ {err:#}");
                }
            }
            Command::Json(query) => diagnose(runtime, query).await?,
            Command::Ask(query) => {
                if let Err(err) = stream_turn(runtime, query).await {
                    eprintln!("❌ {err:#}");
                }
            }
        }
    }

    println!("👋 Hasta pronto. Cuide su salud.");
    Ok(())
}

/// Stream one chat turn to stdout.  Ctrl-C cancels the turn without ending
/// the process.
pub(crate) async fn stream_turn(runtime: &MedexRuntime, query: &str) -> Result<()> {
    let classification = classifier::classify(query);
    println!(
        "🩺 {} ({} · urgencia {})",
        runtime.config().agent.name,
        classification.user_type,
        classification.urgency
    );
    if classification.is_emergency() {
        println!("🚨 EMERGENCIA DETECTADA: busque atención médica inmediata (911).");
    }

    let (tx, rx) = mpsc::channel(64);
    let printer = tokio::spawn(render::print_events(rx));

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = runtime.respond(query, Some(&tx), &cancel).await;
    interrupt.abort();
    drop(tx);
    let _ = printer.await;

    match result {
        Ok(_) => Ok(()),
        Err(RuntimeError::Orchestrator(OrchestratorError::Cancelled)) => {
            println!("\n⏹  Respuesta cancelada");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

pub(crate) async fn analyze_image(runtime: &MedexRuntime, path: &Path, context: &str) -> Result<()> {
    println!("🔬 Analizando {} ...", path.display());
    let analysis = runtime.analyze_image(path, context).await?;
    println!("{analysis}");
    Ok(())
}

pub(crate) async fn diagnose(runtime: &MedexRuntime, query: &str) -> Result<()> {
    let diagnosis = runtime.structured_diagnosis(query).await;
    if diagnosis.is_fallback {
        eprintln!("⚠️  No se obtuvo un diagnóstico estructurado; se muestra la respuesta de respaldo.");
    }
    println!("{}", serde_json::to_string_pretty(&diagnosis)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_aliases() {
        for line in ["/exit", "salir", "QUIT", "  /quit  "] {
            assert_eq!(parse_command(line), Command::Exit, "{line}");
        }
    }

    #[test]
    fn blank_lines_are_ignored() {
        assert_eq!(parse_command("   "), Command::Empty);
    }

    #[test]
    fn image_with_and_without_context() {
        assert_eq!(
            parse_command("/image rx.png paciente de 60 años con tos"),
            Command::Image { path: "rx.png", context: "paciente de 60 años con tos" }
        );
        assert_eq!(parse_command("/image rx.png"), Command::Image { path: "rx.png", context: "" });
        assert!(matches!(parse_command("/image"), Command::Usage(_)));
    }

    #[test]
    fn json_requires_a_query() {
        assert_eq!(parse_command("/json dolor de cabeza"), Command::Json("dolor de cabeza"));
        assert!(matches!(parse_command("/json   "), Command::Usage(_)));
    }

    #[test]
    fn spanish_aliases() {
        assert_eq!(parse_command("estado"), Command::Stats);
        assert_eq!(parse_command("limpiar"), Command::Clear);
        assert_eq!(parse_command("ayuda"), Command::Help);
    }

    #[test]
    fn anything_else_is_a_question() {
        assert_eq!(
            parse_command("Tengo fiebre desde hace 3 días"),
            Command::Ask("Tengo fiebre desde hace 3 días")
        );
        assert_eq!(
            parse_command("estado de salud general"),
            Command::Ask("estado de salud general")
        );
    }
}
