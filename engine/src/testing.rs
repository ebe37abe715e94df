//! Scriptable fake UCI engine for tests.
//!
//! The engine is a POSIX shell script in a temporary directory, run through
//! `/bin/sh`. It counts `go` commands in a file next to the script, so a
//! fault planned for the Nth search holds across restarts of the same mock.

use std::path::PathBuf;

use tempfile::TempDir;

use crate::EngineSpec;

const SCRIPT: &str = r#"#!/bin/sh
DIR=$(cd "$(dirname "$0")" && pwd)
searching=0
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$DIR/commands.log"
  set -- $line
  case "$1" in
    uci)
      if [ "@SILENT@" = 1 ]; then continue; fi
      echo "id name @NAME@"
      echo "id author Mock Authors"
      echo "option name Hash type spin default 16 min 1 max 1024"
      echo "option name Threads type spin default 1 min 1 max 64"
      echo "option name Skill Level type spin default 20 min 0 max 20"
      echo "option name Ponder type check default false"
      echo "option name Style type combo default Normal var Solid var Normal var Risky"
      echo "option name Clear Hash type button"
      echo "uciok"
      ;;
    isready)
      echo "readyok"
      ;;
    go)
      n=$(cat "$DIR/go_count" 2>/dev/null || echo 0)
      n=$((n + 1))
      echo "$n" > "$DIR/go_count"
      case " @HANG@ " in *" $n "*) continue ;; esac
      case " @CRASH@ " in *" $n "*) exit 3 ;; esac
      echo "info depth 1 score @SCORE@ nodes 20 pv @PV@"
      if [ "$2" = "infinite" ]; then
        searching=1
      else
        echo "bestmove @MOVE@"
      fi
      ;;
    stop)
      if [ "$searching" = 1 ]; then
        searching=0
        echo "bestmove @MOVE@"
      fi
      ;;
    quit)
      if [ "@IGNORE_QUIT@" = 0 ]; then exit 0; fi
      ;;
  esac
done
"#;

/// A fake engine on disk. Dropping it removes the directory.
pub struct MockEngine {
    dir: TempDir,
    script: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MockEngineBuilder {
    name: String,
    best_move: String,
    score: String,
    hang_on: Vec<u32>,
    crash_on: Vec<u32>,
    silent_handshake: bool,
    ignore_quit: bool,
}

impl Default for MockEngineBuilder {
    fn default() -> Self {
        Self {
            name: "MockFish 1.0".into(),
            best_move: "e2e4".into(),
            score: "cp 25".into(),
            hang_on: Vec::new(),
            crash_on: Vec::new(),
            silent_handshake: false,
            ignore_quit: false,
        }
    }
}

impl MockEngineBuilder {
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    /// Move reported in every `bestmove`. `(none)` simulates a position
    /// without legal moves.
    pub fn best_move(mut self, uci: &str) -> Self {
        self.best_move = uci.into();
        self
    }

    pub fn score_cp(mut self, cp: i32) -> Self {
        self.score = format!("cp {cp}");
        self
    }

    pub fn score_mate(mut self, moves: i32) -> Self {
        self.score = format!("mate {moves}");
        self
    }

    /// Never answer the given searches (1-based), including their `stop`.
    pub fn hang_on_search(mut self, n: u32) -> Self {
        self.hang_on.push(n);
        self
    }

    /// Exit without answering on the given searches (1-based).
    pub fn crash_on_search(mut self, n: u32) -> Self {
        self.crash_on.push(n);
        self
    }

    /// Never answer `uci`.
    pub fn silent_handshake(mut self) -> Self {
        self.silent_handshake = true;
        self
    }

    pub fn ignore_quit(mut self) -> Self {
        self.ignore_quit = true;
        self
    }

    pub fn build(self) -> std::io::Result<MockEngine> {
        let join = |v: &[u32]| {
            v.iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        };
        let pv = if self.best_move.starts_with('(') {
            String::new()
        } else {
            self.best_move.clone()
        };
        let script = SCRIPT
            .replace("@NAME@", &self.name)
            .replace("@MOVE@", &self.best_move)
            .replace("@PV@", &pv)
            .replace("@SCORE@", &self.score)
            .replace("@HANG@", &join(&self.hang_on))
            .replace("@CRASH@", &join(&self.crash_on))
            .replace("@SILENT@", if self.silent_handshake { "1" } else { "0" })
            .replace("@IGNORE_QUIT@", if self.ignore_quit { "1" } else { "0" });

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("engine.sh");
        std::fs::write(&path, script)?;
        Ok(MockEngine { dir, script: path })
    }
}

impl MockEngine {
    pub fn builder() -> MockEngineBuilder {
        MockEngineBuilder::default()
    }

    /// A well-behaved engine answering `e2e4`.
    pub fn healthy() -> std::io::Result<Self> {
        Self::builder().build()
    }

    pub fn spec(&self) -> EngineSpec {
        EngineSpec {
            path: PathBuf::from("/bin/sh"),
            args: vec![self.script.display().to_string()],
            options: Default::default(),
        }
    }

    /// Searches started so far, across every process launched from this mock.
    pub fn searches(&self) -> u32 {
        std::fs::read_to_string(self.dir.path().join("go_count"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Every line the engine received, in order.
    pub fn commands(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("commands.log"))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}
