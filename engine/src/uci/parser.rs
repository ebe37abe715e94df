use crate::options::{OptionKind, OptionSpec};
use crate::EngineInfo;
use chess::{parse_uci_move, AnalysisScore};

/// Incoming message from UCI engine
#[derive(Debug, Clone)]
pub enum UciMessage {
    Id { name: String, value: String },
    Option(OptionSpec),
    UciOk,
    ReadyOk,
    /// `mv` is `None` for `bestmove (none)` / `bestmove 0000`, sent when the
    /// position has no legal moves.
    BestMove {
        mv: Option<cozy_chess::Move>,
        ponder: Option<cozy_chess::Move>,
    },
    Info(EngineInfo),
}

/// Parse a UCI message line
pub fn parse_uci_message(line: &str) -> Result<UciMessage, crate::UciError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();

    match tokens.first() {
        Some(&"uciok") => Ok(UciMessage::UciOk),
        Some(&"readyok") => Ok(UciMessage::ReadyOk),

        Some(&"id") => {
            if tokens.len() < 3 {
                return Err(crate::UciError::MalformedMessage(line.to_string()));
            }
            let name = tokens[1].to_string();
            let value = tokens[2..].join(" ");
            Ok(UciMessage::Id { name, value })
        }

        Some(&"option") => parse_option_line(&tokens[1..])
            .map(UciMessage::Option)
            .ok_or_else(|| crate::UciError::MalformedMessage(line.to_string())),

        Some(&"bestmove") => {
            let Some(&first) = tokens.get(1) else {
                return Err(crate::UciError::MalformedMessage(line.to_string()));
            };
            let mv = match first {
                "(none)" | "0000" => None,
                s => Some(parse_uci_move(s)?),
            };
            let ponder = match (tokens.get(2), tokens.get(3)) {
                (Some(&"ponder"), Some(s)) => parse_uci_move(s).ok(),
                _ => None,
            };
            Ok(UciMessage::BestMove { mv, ponder })
        }

        Some(&"info") => Ok(UciMessage::Info(parse_info_line(&tokens[1..]))),

        _ => Err(crate::UciError::UnknownMessage(line.to_string())),
    }
}

/// Parse an "info" line from the engine
fn parse_info_line(tokens: &[&str]) -> EngineInfo {
    let mut info = EngineInfo::default();
    let mut i = 0;

    while i < tokens.len() {
        match tokens[i] {
            "depth" => {
                i += 1;
                info.depth = tokens.get(i).and_then(|s| s.parse().ok());
            }
            "seldepth" => {
                i += 1;
                info.seldepth = tokens.get(i).and_then(|s| s.parse().ok());
            }
            "time" => {
                i += 1;
                info.time_ms = tokens.get(i).and_then(|s| s.parse().ok());
            }
            "nodes" => {
                i += 1;
                info.nodes = tokens.get(i).and_then(|s| s.parse().ok());
            }
            "nps" => {
                i += 1;
                info.nps = tokens.get(i).and_then(|s| s.parse().ok());
            }
            "score" => {
                i += 1;
                if let Some(&score_type) = tokens.get(i) {
                    i += 1;
                    if let Some(value_str) = tokens.get(i) {
                        info.score = match score_type {
                            "cp" => value_str.parse().ok().map(AnalysisScore::Centipawns),
                            "mate" => value_str.parse().ok().map(AnalysisScore::Mate),
                            _ => None,
                        };
                    }
                }
            }
            "pv" => {
                // Collect all moves until next keyword
                i += 1;
                while i < tokens.len() && !is_keyword(tokens[i]) {
                    if let Ok(mv) = parse_uci_move(tokens[i]) {
                        info.pv.push(mv);
                    }
                    i += 1;
                }
                continue;
            }
            "multipv" => {
                i += 1;
                info.multipv = tokens.get(i).and_then(|s| s.parse().ok());
            }
            "currmove" => {
                i += 1;
                info.currmove = tokens.get(i).and_then(|s| parse_uci_move(s).ok());
            }
            "hashfull" => {
                i += 1;
                info.hashfull = tokens.get(i).and_then(|s| s.parse().ok());
            }
            // Free text runs to the end of the line.
            "string" => break,
            _ => {}
        }
        i += 1;
    }

    info
}

fn is_keyword(token: &str) -> bool {
    matches!(
        token,
        "depth"
            | "seldepth"
            | "time"
            | "nodes"
            | "score"
            | "pv"
            | "multipv"
            | "currmove"
            | "currmovenumber"
            | "hashfull"
            | "nps"
            | "tbhits"
            | "cpuload"
            | "string"
    )
}

fn is_option_keyword(token: &str) -> bool {
    matches!(token, "name" | "type" | "default" | "min" | "max" | "var")
}

/// Parse the body of `option name <id> type <t> [default x] [min x] [max x] [var x]*`.
///
/// Names and values may contain spaces, so each field runs until the next
/// option keyword.
fn parse_option_line(tokens: &[&str]) -> Option<OptionSpec> {
    let mut name: Option<String> = None;
    let mut kind: Option<&str> = None;
    let mut default: Option<String> = None;
    let mut min: Option<i64> = None;
    let mut max: Option<i64> = None;
    let mut vars = Vec::new();

    let mut i = 0;
    while i < tokens.len() {
        let keyword = tokens[i];
        let start = i + 1;
        let mut end = start;
        while end < tokens.len() && !is_option_keyword(tokens[end]) {
            end += 1;
        }
        let value = tokens[start..end].join(" ");
        match keyword {
            "name" => name = Some(value),
            "type" => kind = tokens.get(start).copied(),
            "default" => default = Some(value),
            "min" => min = value.parse().ok(),
            "max" => max = value.parse().ok(),
            "var" => vars.push(value),
            _ => {}
        }
        i = end;
    }

    let name = name.filter(|n| !n.is_empty())?;
    // `<empty>` is the conventional spelling of an empty string default.
    let default = default.map(|d| if d == "<empty>" { String::new() } else { d });

    let kind = match kind? {
        "spin" => OptionKind::Spin {
            default: default.and_then(|d| d.parse().ok()),
            min,
            max,
        },
        "check" => OptionKind::Check {
            default: default.and_then(|d| d.parse().ok()),
        },
        "combo" => OptionKind::Combo {
            default,
            choices: vars,
        },
        "string" => OptionKind::Text { default },
        "button" => OptionKind::Button,
        _ => return None,
    };

    Some(OptionSpec { name, kind })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chess::format_uci_move;

    #[test]
    fn test_parse_bestmove() {
        let msg = parse_uci_message("bestmove e2e4 ponder e7e5").unwrap();
        match msg {
            UciMessage::BestMove { mv, ponder } => {
                assert_eq!(format_uci_move(mv.unwrap()), "e2e4");
                assert_eq!(format_uci_move(ponder.unwrap()), "e7e5");
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_parse_bestmove_none() {
        for line in ["bestmove (none)", "bestmove 0000"] {
            match parse_uci_message(line).unwrap() {
                UciMessage::BestMove { mv, ponder } => {
                    assert!(mv.is_none());
                    assert!(ponder.is_none());
                }
                other => panic!("Wrong message type: {other:?}"),
            }
        }
    }

    #[test]
    fn test_parse_info() {
        let msg = parse_uci_message("info depth 12 score cp 35 nodes 15234 pv e2e4 e7e5").unwrap();
        match msg {
            UciMessage::Info(info) => {
                assert_eq!(info.depth, Some(12));
                assert_eq!(info.score, Some(AnalysisScore::Centipawns(35)));
                assert_eq!(info.nodes, Some(15234));
                assert_eq!(info.pv.len(), 2);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_parse_info_mate_and_string() {
        let msg = parse_uci_message("info depth 5 score mate -3 string pv is not a pv").unwrap();
        match msg {
            UciMessage::Info(info) => {
                assert_eq!(info.score, Some(AnalysisScore::Mate(-3)));
                assert!(info.pv.is_empty());
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_parse_spin_option() {
        let msg = parse_uci_message("option name Skill Level type spin default 20 min 0 max 20")
            .unwrap();
        match msg {
            UciMessage::Option(spec) => {
                assert_eq!(spec.name, "Skill Level");
                assert_eq!(
                    spec.kind,
                    OptionKind::Spin {
                        default: Some(20),
                        min: Some(0),
                        max: Some(20)
                    }
                );
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_parse_combo_and_string_options() {
        let combo = parse_uci_message(
            "option name Analysis Contempt type combo default Both var Off var White var Black var Both",
        )
        .unwrap();
        match combo {
            UciMessage::Option(spec) => match spec.kind {
                OptionKind::Combo { default, choices } => {
                    assert_eq!(default.as_deref(), Some("Both"));
                    assert_eq!(choices, vec!["Off", "White", "Black", "Both"]);
                }
                other => panic!("Wrong kind: {other:?}"),
            },
            _ => panic!("Wrong message type"),
        }

        let text = parse_uci_message("option name SyzygyPath type string default <empty>").unwrap();
        match text {
            UciMessage::Option(spec) => {
                assert_eq!(
                    spec.kind,
                    OptionKind::Text {
                        default: Some(String::new())
                    }
                );
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_parse_button_and_check() {
        assert!(matches!(
            parse_uci_message("option name Clear Hash type button").unwrap(),
            UciMessage::Option(OptionSpec { kind: OptionKind::Button, .. })
        ));
        assert!(matches!(
            parse_uci_message("option name Ponder type check default false").unwrap(),
            UciMessage::Option(OptionSpec { kind: OptionKind::Check { default: Some(false) }, .. })
        ));
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert!(matches!(
            parse_uci_message("Stockfish 16 by the Stockfish developers"),
            Err(crate::UciError::UnknownMessage(_))
        ));
        assert!(matches!(
            parse_uci_message("option type spin"),
            Err(crate::UciError::MalformedMessage(_))
        ));
        assert!(parse_uci_message("bestmove").is_err());
    }
}
