//! Line-oriented console over one debug session.
//!
//! Input starting with `.` is a debugger command; anything else is code to
//! evaluate. Evaluations run in the background so the engine can be stepped
//! while it is paused inside one.

use std::io;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use v8_debug_client::protocol::BacktraceArgs;
use v8_debug_client::{BreakEvent, Breakpoint, BreakpointSpec, ExceptionEvent, StepAction};

use crate::engine::EvalResult;
use crate::session::{DebugSession, SessionError, SessionState};

const PROMPT: &str = "> ";

const HELP: &str = "\
.break LINE[:COLUMN] [if CONDITION]  set a breakpoint
.clear NUMBER                        clear a breakpoint
.breakpoints                         list breakpoints
.continue [in|next|out] [COUNT]      resume or step
.bt                                  backtrace
.frame [NUMBER]                      select or show a frame
.scopes [FRAME]                      list scopes of a frame
.vars [SCOPE] [FRAME]                resolve scope variables
.print EXPRESSION                    evaluate in the paused frame
.interrupt                           stop running code
.quit                                leave
";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Evaluate(String),
    Break(BreakpointSpec),
    Clear(u32),
    Breakpoints,
    Continue {
        action: StepAction,
        count: Option<u32>,
    },
    Backtrace,
    Frame(Option<u32>),
    Scopes(Option<u32>),
    Vars {
        scope: Option<u32>,
        frame: Option<u32>,
    },
    Print(String),
    Interrupt,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command .{0} (try .help)")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("not a number: {0}")]
    Number(String),
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, ParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let Some(command) = trimmed.strip_prefix('.') else {
        return Ok(Some(ConsoleCommand::Evaluate(line.to_string())));
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();

    let parsed = match name {
        "break" | "b" => ConsoleCommand::Break(parse_breakpoint(rest)?),
        "clear" => match args.as_slice() {
            [number] => ConsoleCommand::Clear(number_arg(number)?),
            _ => return Err(ParseError::Usage(".clear NUMBER")),
        },
        "breakpoints" => ConsoleCommand::Breakpoints,
        "continue" | "c" => parse_continue(&args)?,
        "bt" | "backtrace" => ConsoleCommand::Backtrace,
        "frame" => ConsoleCommand::Frame(optional_number(args.first())?),
        "scopes" => ConsoleCommand::Scopes(optional_number(args.first())?),
        "vars" => ConsoleCommand::Vars {
            scope: optional_number(args.first())?,
            frame: optional_number(args.get(1))?,
        },
        "print" | "p" if !rest.is_empty() => ConsoleCommand::Print(rest.to_string()),
        "print" | "p" => return Err(ParseError::Usage(".print EXPRESSION")),
        "interrupt" => ConsoleCommand::Interrupt,
        "help" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(parsed))
}

fn parse_breakpoint(rest: &str) -> Result<BreakpointSpec, ParseError> {
    const USAGE: &str = ".break LINE[:COLUMN] [if CONDITION]";
    let (location, condition) = match rest.split_once(" if ") {
        Some((location, condition)) => (location.trim(), Some(condition.trim())),
        None => (rest.trim(), None),
    };
    if location.is_empty() || location.contains(char::is_whitespace) {
        return Err(ParseError::Usage(USAGE));
    }

    let mut spec = match location.split_once(':') {
        Some((line, column)) => {
            BreakpointSpec::at_line(number_arg(line)?).column(number_arg(column)?)
        }
        None => BreakpointSpec::at_line(number_arg(location)?),
    };
    if let Some(condition) = condition {
        if condition.is_empty() {
            return Err(ParseError::Usage(USAGE));
        }
        spec = spec.condition(condition);
    }
    Ok(spec)
}

fn parse_continue(args: &[&str]) -> Result<ConsoleCommand, ParseError> {
    const USAGE: &str = ".continue [in|next|out] [COUNT]";
    let (action, count) = match args {
        [] => (StepAction::Out, None),
        [action] => (action.parse().map_err(|_| ParseError::Usage(USAGE))?, None),
        [action, count] => (
            action.parse().map_err(|_| ParseError::Usage(USAGE))?,
            Some(number_arg(count)?),
        ),
        _ => return Err(ParseError::Usage(USAGE)),
    };
    Ok(ConsoleCommand::Continue { action, count })
}

fn number_arg(text: &str) -> Result<u32, ParseError> {
    text.parse()
        .map_err(|_| ParseError::Number(text.to_string()))
}

fn optional_number(text: Option<&&str>) -> Result<Option<u32>, ParseError> {
    text.map(|text| number_arg(text)).transpose()
}

/// Runs the console until `.quit`, end of input, or the debugger going away.
pub async fn run<R, W>(session: DebugSession, input: R, mut output: W) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut breaks = session.subscribe_breaks();
    let mut exceptions = session.subscribe_exceptions();
    let mut state = session.subscribe_state();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    output.write_all(PROMPT.as_bytes()).await?;
    output.flush().await?;
    loop {
        let text = tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_line(&line) {
                    Ok(None) => String::new(),
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(ConsoleCommand::Evaluate(code))) => {
                        let session = session.clone();
                        let done = done_tx.clone();
                        tokio::spawn(async move {
                            let _ = done.send(session.evaluate(&code).await);
                        });
                        continue;
                    }
                    Ok(Some(command)) => execute(&session, command).await,
                    Err(err) => format!("{err}\n"),
                }
            }
            Some(outcome) = done_rx.recv() => render_outcome(outcome),
            event = breaks.recv() => match event {
                Ok(event) => render_break(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "console missed break events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
            event = exceptions.recv() => match event {
                Ok(event) => render_exception(&event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() || *state.borrow_and_update() == SessionState::Disconnected {
                    output.write_all(b"debugger disconnected\n").await?;
                    break;
                }
                continue;
            }
        };
        output.write_all(text.as_bytes()).await?;
        output.write_all(PROMPT.as_bytes()).await?;
        output.flush().await?;
    }
    debug!(session = %session.name(), "console closed");
    output.flush().await
}

async fn execute(session: &DebugSession, command: ConsoleCommand) -> String {
    let outcome = match command {
        ConsoleCommand::Break(spec) => session
            .set_breakpoint(spec)
            .await
            .map(|number| format!("breakpoint {number} set\n")),
        ConsoleCommand::Clear(number) => session
            .clear_breakpoint(number)
            .await
            .map(|()| format!("breakpoint {number} cleared\n")),
        ConsoleCommand::Breakpoints => session
            .list_breakpoints()
            .await
            .map(|breakpoints| render_breakpoints(&breakpoints)),
        ConsoleCommand::Continue { action, count } => session
            .continue_execution(action, count)
            .await
            .map(|_| String::new()),
        ConsoleCommand::Backtrace => session
            .backtrace(BacktraceArgs::default())
            .await
            .map(|body| pretty(&body)),
        ConsoleCommand::Frame(number) => session.frame(number).await.map(|body| pretty(&body)),
        ConsoleCommand::Scopes(frame) => session.scopes(frame).await.map(|body| pretty(&body)),
        ConsoleCommand::Vars { scope, frame } => session
            .get_scope_variables(scope, frame)
            .await
            .map(|scopes| pretty(&scopes)),
        ConsoleCommand::Print(expression) => session
            .evaluate_immediate(&expression, true)
            .await
            .map(|result| format!("{}\n", result.display_text())),
        ConsoleCommand::Interrupt => session
            .interrupt()
            .await
            .map(|()| "interrupted\n".to_string()),
        ConsoleCommand::Help => Ok(HELP.to_string()),
        // Handled by the run loop.
        ConsoleCommand::Evaluate(_) | ConsoleCommand::Quit => Ok(String::new()),
    };
    outcome.unwrap_or_else(|err| format!("error: {err}\n"))
}

fn render_outcome(outcome: Result<EvalResult, SessionError>) -> String {
    match outcome {
        Ok(result) if result.success => format!("{}\n", result.display_text()),
        Ok(result) => format!("error: {}\n", result.display_text()),
        Err(err) => format!("evaluation failed: {err}\n"),
    }
}

pub(crate) fn render_break(event: &BreakEvent) -> String {
    let script = event.script_name().unwrap_or("<unknown>");
    let mut text = format!(
        "\nbreak in {script} at line {}",
        event.source_line.map_or_else(|| "?".to_string(), |line| line.to_string())
    );
    if let Some(column) = event.source_column {
        text.push_str(&format!(":{column}"));
    }
    if !event.breakpoints.is_empty() {
        let numbers: Vec<String> = event.breakpoints.iter().map(u32::to_string).collect();
        text.push_str(&format!(" (breakpoint {})", numbers.join(", ")));
    }
    text.push('\n');
    if let Some(source) = &event.source_line_text {
        text.push_str(&format!("  {}\n", source.trim_end()));
    }
    text
}

pub(crate) fn render_exception(event: &ExceptionEvent) -> String {
    let kind = if event.uncaught { "uncaught exception" } else { "exception" };
    format!("\n{kind}: {}\n", event.description())
}

fn render_breakpoints(breakpoints: &[Breakpoint]) -> String {
    if breakpoints.is_empty() {
        return "no breakpoints\n".to_string();
    }
    let mut text = String::new();
    for breakpoint in breakpoints {
        let line = breakpoint
            .line
            .map_or_else(|| "?".to_string(), |line| line.to_string());
        text.push_str(&format!("#{} line {line}", breakpoint.number));
        if let Some(column) = breakpoint.column {
            text.push_str(&format!(":{column}"));
        }
        if !breakpoint.enabled {
            text.push_str(" disabled");
        }
        if let Some(condition) = &breakpoint.condition {
            text.push_str(&format!(" if {condition}"));
        }
        if let Some(hits) = breakpoint.hit_count {
            text.push_str(&format!(" hits={hits}"));
        }
        text.push('\n');
    }
    text
}

fn pretty<T: Serialize + ?Sized>(value: &T) -> String {
    match serde_json::to_string_pretty(value) {
        Ok(text) => format!("{text}\n"),
        Err(err) => format!("error: {err}\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> ConsoleCommand {
        parse_line(line).unwrap().unwrap()
    }

    #[test]
    fn plain_input_is_code() {
        assert_eq!(parse("1 + 1"), ConsoleCommand::Evaluate("1 + 1".to_string()));
        assert_eq!(parse_line("   ").unwrap(), None);
    }

    #[test]
    fn break_forms() {
        assert_eq!(parse(".break 5"), ConsoleCommand::Break(BreakpointSpec::at_line(5)));
        assert_eq!(
            parse(".break 5:3"),
            ConsoleCommand::Break(BreakpointSpec::at_line(5).column(3))
        );
        assert_eq!(
            parse(".b 7 if x > 1"),
            ConsoleCommand::Break(BreakpointSpec::at_line(7).condition("x > 1"))
        );
        assert_eq!(parse_line(".break"), Err(ParseError::Usage(".break LINE[:COLUMN] [if CONDITION]")));
        assert_eq!(parse_line(".break x"), Err(ParseError::Number("x".to_string())));
    }

    #[test]
    fn continue_forms() {
        assert_eq!(
            parse(".continue"),
            ConsoleCommand::Continue {
                action: StepAction::Out,
                count: None
            }
        );
        assert_eq!(
            parse(".c next 3"),
            ConsoleCommand::Continue {
                action: StepAction::Next,
                count: Some(3)
            }
        );
        assert!(matches!(parse_line(".continue sideways"), Err(ParseError::Usage(_))));
    }

    #[test]
    fn inspection_commands() {
        assert_eq!(parse(".frame"), ConsoleCommand::Frame(None));
        assert_eq!(parse(".scopes 2"), ConsoleCommand::Scopes(Some(2)));
        assert_eq!(
            parse(".vars 1 0"),
            ConsoleCommand::Vars {
                scope: Some(1),
                frame: Some(0)
            }
        );
        assert_eq!(parse(".print a.b"), ConsoleCommand::Print("a.b".to_string()));
        assert_eq!(parse(".clear 4"), ConsoleCommand::Clear(4));
        assert_eq!(parse(".quit"), ConsoleCommand::Quit);
        assert_eq!(parse_line(".launch"), Err(ParseError::Unknown("launch".to_string())));
    }

    #[test]
    fn break_event_rendering() {
        let event = BreakEvent {
            source_line: Some(4),
            source_column: Some(2),
            source_line_text: Some("  x = 1;".to_string()),
            breakpoints: vec![3],
            ..BreakEvent::default()
        };
        let text = render_break(&event);
        assert!(text.contains("at line 4:2 (breakpoint 3)"));
        assert!(text.ends_with("    x = 1;\n"));
    }
}
