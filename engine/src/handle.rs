use std::future::Future;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::options::{OptionSchema, OptionSpec, OptionValue, COMMON_OPTIONS};
use crate::process::{Recv, UciProcess};
use crate::uci::UciMessage;
use crate::{
    EngineError, EngineIdentity, EngineInfo, EngineSpec, EngineTimeouts, EvaluationOutcome,
    MoveResult, Readiness, SearchLimit, SearchPosition,
};

/// Where the engine is in the request/answer cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtocolState {
    Idle,
    Searching,
    /// `stop` sent, waiting for the closing `bestmove`.
    Draining,
    /// The engine stopped answering; only a restart helps.
    Faulted,
}

struct Inner {
    process: Option<UciProcess>,
    protocol: ProtocolState,
}

/// A running UCI engine. All requests go through an async mutex, so at most
/// one search is in flight per process.
pub struct EngineHandle {
    spec: EngineSpec,
    label: String,
    identity: EngineIdentity,
    schema: OptionSchema,
    applied: Vec<(String, OptionValue)>,
    timeouts: EngineTimeouts,
    readiness: watch::Sender<Readiness>,
    inner: Mutex<Inner>,
}

impl EngineHandle {
    /// Launch the engine, complete the UCI handshake and apply the configured
    /// options. Options the engine does not advertise, or whose values do not
    /// fit its schema, are skipped with a warning.
    #[tracing::instrument(skip(spec, timeouts), fields(path = %spec.path.display()))]
    pub async fn start(
        spec: &EngineSpec,
        label: &str,
        timeouts: EngineTimeouts,
    ) -> Result<Self, EngineError> {
        let (readiness, _) = watch::channel(Readiness::Starting);
        let mut process = UciProcess::spawn(spec, label)?;

        let (identity, schema, applied) = match initialize(&mut process, spec, &timeouts).await {
            Ok(ready) => ready,
            Err(e) => {
                tracing::warn!(engine = label, "Engine failed to start: {}", e);
                process.shutdown(timeouts.stop_grace()).await;
                return Err(e);
            }
        };

        tracing::info!(
            engine = label,
            name = identity.name.as_deref().unwrap_or("unknown"),
            options = schema.len(),
            applied = applied.len(),
            "Engine ready"
        );
        readiness.send_replace(Readiness::Ready);

        Ok(Self {
            spec: spec.clone(),
            label: label.to_string(),
            identity,
            schema,
            applied,
            timeouts,
            readiness,
            inner: Mutex::new(Inner {
                process: Some(process),
                protocol: ProtocolState::Idle,
            }),
        })
    }

    /// Reported engine name, falling back to the executable's file name.
    pub fn name(&self) -> String {
        if let Some(name) = &self.identity.name {
            return name.clone();
        }
        self.spec
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.label.clone())
    }

    pub fn identity(&self) -> &EngineIdentity {
        &self.identity
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn spec(&self) -> &EngineSpec {
        &self.spec
    }

    pub fn schema(&self) -> &OptionSchema {
        &self.schema
    }

    pub fn applied_options(&self) -> &[(String, OptionValue)] {
        &self.applied
    }

    /// Advertised options that most engines share, in advertised form.
    pub fn common_options(&self) -> Vec<&OptionSpec> {
        COMMON_OPTIONS
            .iter()
            .filter_map(|name| self.schema.get(name))
            .collect()
    }

    pub fn readiness(&self) -> Readiness {
        *self.readiness.borrow()
    }

    /// Search `position` and return the engine's chosen move.
    ///
    /// A timed search that produces nothing within its budget plus the grace
    /// period fails with [`EngineError::Timeout`]; the search is stopped and
    /// the engine stays usable when it acknowledges the stop.
    pub async fn request_move(
        &self,
        position: &SearchPosition,
        limit: SearchLimit,
    ) -> Result<MoveResult, EngineError> {
        let mut inner = self.inner.lock().await;
        self.readiness.send_replace(Readiness::Busy);
        tracing::debug!(engine = %self.label, moves = position.moves.len(), ?limit, "Move request");
        let result = inner.search_move(position, limit, &self.timeouts).await;
        self.settle(&inner);
        result
    }

    /// Analyse `position` with an unbounded search until `cancelled`
    /// resolves, the search runs for the configured maximum, or the engine
    /// finishes on its own. `on_progress` sees every `info` line carrying a
    /// score.
    ///
    /// Dropping the returned future mid-search is allowed: the next request
    /// on this handle stops the abandoned search before starting its own.
    pub async fn request_evaluation<F, P>(
        &self,
        position: &SearchPosition,
        cancelled: F,
        mut on_progress: P,
    ) -> Result<EvaluationOutcome, EngineError>
    where
        F: Future<Output = ()>,
        P: FnMut(&EngineInfo),
    {
        let mut inner = self.inner.lock().await;
        self.readiness.send_replace(Readiness::Busy);
        let result = inner
            .evaluate(position, cancelled, &mut on_progress, &self.timeouts)
            .await;
        self.settle(&inner);
        result
    }

    /// Tell the engine a new game starts (`ucinewgame`) and wait until it
    /// is ready again.
    pub async fn new_game(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        let result = inner.new_game(&self.timeouts).await;
        self.settle(&inner);
        result
    }

    /// Quit the engine, killing it after the grace period. Idempotent.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(process) = inner.process.take() {
            tracing::info!(engine = %self.label, "Stopping engine");
            process.shutdown(self.timeouts.stop_grace()).await;
        }
        self.settle(&inner);
    }

    fn settle(&self, inner: &Inner) {
        let next = match (&inner.process, inner.protocol) {
            (None, _) => Readiness::Stopped,
            (Some(_), ProtocolState::Idle) => Readiness::Ready,
            (Some(_), ProtocolState::Faulted) => Readiness::Faulted,
            (Some(_), _) => Readiness::Busy,
        };
        self.readiness.send_replace(next);
    }
}

async fn initialize(
    process: &mut UciProcess,
    spec: &EngineSpec,
    timeouts: &EngineTimeouts,
) -> Result<(EngineIdentity, OptionSchema, Vec<(String, OptionValue)>), EngineError> {
    let path = spec.path.display().to_string();
    let closed = || EngineError::launch(&path, "engine exited during handshake");

    process.send("uci").await.map_err(|_| closed())?;

    let mut identity = EngineIdentity::default();
    let mut schema = OptionSchema::new();
    let deadline = Instant::now() + timeouts.handshake();
    loop {
        match process.recv_until(deadline).await {
            Recv::Message(UciMessage::Id { name, value }) => match name.as_str() {
                "name" => identity.name = Some(value),
                "author" => identity.author = Some(value),
                _ => {}
            },
            Recv::Message(UciMessage::Option(option)) => schema.insert(option),
            Recv::Message(UciMessage::UciOk) => break,
            Recv::Message(_) => {}
            Recv::Closed => return Err(closed()),
            Recv::Deadline => {
                return Err(EngineError::launch(
                    &path,
                    format!("no uciok within {:?}", timeouts.handshake()),
                ))
            }
        }
    }

    let mut applied = Vec::new();
    for (name, raw) in &spec.options {
        match schema.coerce(name, raw) {
            Ok((name, value)) => {
                process
                    .send(value.to_setoption(&name))
                    .await
                    .map_err(|_| closed())?;
                applied.push((name, value));
            }
            Err(e) => {
                tracing::warn!(engine = process.label(), "Skipping engine option: {}", e);
            }
        }
    }

    process.send("isready").await.map_err(|_| closed())?;
    let deadline = Instant::now() + timeouts.handshake();
    match process
        .wait_for(deadline, |m| matches!(m, UciMessage::ReadyOk))
        .await
    {
        Recv::Message(_) => Ok((identity, schema, applied)),
        Recv::Closed => Err(closed()),
        Recv::Deadline => Err(EngineError::launch(
            &path,
            format!("no readyok within {:?}", timeouts.handshake()),
        )),
    }
}

impl Inner {
    /// Bring the engine back to idle if an earlier request was abandoned.
    async fn resync(&mut self, timeouts: &EngineTimeouts) -> Result<(), EngineError> {
        match self.protocol {
            ProtocolState::Idle => Ok(()),
            ProtocolState::Faulted => Err(EngineError::Protocol(
                "engine did not recover from an earlier failure".into(),
            )),
            ProtocolState::Searching | ProtocolState::Draining => {
                self.drain(timeouts).await?;
                self.sync_ready(timeouts.drain()).await
            }
        }
    }

    /// Stop the running search and swallow its closing `bestmove`.
    async fn drain(&mut self, timeouts: &EngineTimeouts) -> Result<(), EngineError> {
        let Some(process) = self.process.as_mut() else {
            return Err(EngineError::NotRunning);
        };
        self.protocol = ProtocolState::Draining;
        if let Err(e) = process.send("stop").await {
            self.protocol = ProtocolState::Faulted;
            return Err(e);
        }
        let deadline = Instant::now() + timeouts.drain();
        match process
            .wait_for(deadline, |m| matches!(m, UciMessage::BestMove { .. }))
            .await
        {
            Recv::Message(_) => {
                self.protocol = ProtocolState::Idle;
                Ok(())
            }
            Recv::Closed => {
                self.protocol = ProtocolState::Faulted;
                Err(EngineError::Crashed)
            }
            Recv::Deadline => {
                tracing::warn!(engine = process.label(), "Engine ignored stop");
                self.protocol = ProtocolState::Faulted;
                Err(EngineError::Timeout(timeouts.drain()))
            }
        }
    }

    async fn sync_ready(&mut self, wait: std::time::Duration) -> Result<(), EngineError> {
        let Some(process) = self.process.as_mut() else {
            return Err(EngineError::NotRunning);
        };
        if let Err(e) = process.send("isready").await {
            self.protocol = ProtocolState::Faulted;
            return Err(e);
        }
        match process
            .wait_for(Instant::now() + wait, |m| matches!(m, UciMessage::ReadyOk))
            .await
        {
            Recv::Message(_) => Ok(()),
            Recv::Closed => {
                self.protocol = ProtocolState::Faulted;
                Err(EngineError::Crashed)
            }
            Recv::Deadline => {
                self.protocol = ProtocolState::Faulted;
                Err(EngineError::Timeout(wait))
            }
        }
    }

    async fn start_search(
        &mut self,
        position: &SearchPosition,
        go: String,
        timeouts: &EngineTimeouts,
    ) -> Result<(), EngineError> {
        self.resync(timeouts).await?;
        let Some(process) = self.process.as_mut() else {
            return Err(EngineError::NotRunning);
        };
        let sent = match process.send(position.to_uci_command()).await {
            Ok(()) => process.send(go).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => {
                self.protocol = ProtocolState::Searching;
                Ok(())
            }
            Err(e) => {
                self.protocol = ProtocolState::Faulted;
                Err(e)
            }
        }
    }

    async fn search_move(
        &mut self,
        position: &SearchPosition,
        limit: SearchLimit,
        timeouts: &EngineTimeouts,
    ) -> Result<MoveResult, EngineError> {
        self.start_search(position, limit.to_go_command(), timeouts)
            .await?;
        let Some(process) = self.process.as_mut() else {
            return Err(EngineError::NotRunning);
        };

        let started = Instant::now();
        let allowed = timeouts.move_deadline(limit);
        let deadline = started + allowed;
        let mut latest = EngineInfo::default();

        loop {
            match process.recv_until(deadline).await {
                Recv::Message(UciMessage::Info(info)) => merge_info(&mut latest, info),
                Recv::Message(UciMessage::BestMove { mv, ponder }) => {
                    self.protocol = ProtocolState::Idle;
                    let best_move = mv.ok_or(EngineError::NoMove)?;
                    return Ok(MoveResult {
                        best_move,
                        ponder,
                        score: latest.score,
                        depth: latest.depth,
                        pv: latest.pv,
                        elapsed: started.elapsed(),
                    });
                }
                Recv::Message(_) => {}
                Recv::Closed => {
                    tracing::warn!(engine = process.label(), "Engine exited during search");
                    self.protocol = ProtocolState::Faulted;
                    return Err(EngineError::Crashed);
                }
                Recv::Deadline => {
                    tracing::warn!(
                        engine = process.label(),
                        "No bestmove within {:?}, stopping search",
                        allowed
                    );
                    // A timely answer to `stop` leaves the engine usable.
                    let _ = self.drain(timeouts).await;
                    return Err(EngineError::Timeout(allowed));
                }
            }
        }
    }

    async fn evaluate<F, P>(
        &mut self,
        position: &SearchPosition,
        cancelled: F,
        on_progress: &mut P,
        timeouts: &EngineTimeouts,
    ) -> Result<EvaluationOutcome, EngineError>
    where
        F: Future<Output = ()>,
        P: FnMut(&EngineInfo),
    {
        self.start_search(position, "go infinite".to_string(), timeouts)
            .await?;
        let Some(process) = self.process.as_mut() else {
            return Err(EngineError::NotRunning);
        };

        tokio::pin!(cancelled);
        let deadline = Instant::now() + timeouts.evaluation_max();
        let mut latest = EngineInfo::default();

        loop {
            tokio::select! {
                biased;

                _ = &mut cancelled => break,

                recv = process.recv_until(deadline) => match recv {
                    Recv::Message(UciMessage::Info(info)) => {
                        if info.score.is_some() && info.multipv.unwrap_or(1) == 1 {
                            on_progress(&info);
                        }
                        merge_info(&mut latest, info);
                    }
                    Recv::Message(UciMessage::BestMove { .. }) => {
                        self.protocol = ProtocolState::Idle;
                        return Ok(outcome(latest, true));
                    }
                    Recv::Message(_) => {}
                    Recv::Closed => {
                        self.protocol = ProtocolState::Faulted;
                        return Err(EngineError::Crashed);
                    }
                    Recv::Deadline => break,
                },
            }
        }

        self.drain(timeouts).await?;
        Ok(outcome(latest, false))
    }

    async fn new_game(&mut self, timeouts: &EngineTimeouts) -> Result<(), EngineError> {
        self.resync(timeouts).await?;
        let Some(process) = self.process.as_mut() else {
            return Err(EngineError::NotRunning);
        };
        if let Err(e) = process.send("ucinewgame").await {
            self.protocol = ProtocolState::Faulted;
            return Err(e);
        }
        self.sync_ready(timeouts.handshake()).await
    }
}

/// Fold an `info` line into the running summary. Secondary lines and lines
/// without a score do not replace the main line's figures.
fn merge_info(latest: &mut EngineInfo, info: EngineInfo) {
    if info.multipv.unwrap_or(1) != 1 {
        return;
    }
    if info.depth.is_some() {
        latest.depth = info.depth;
    }
    if info.score.is_some() {
        latest.score = info.score;
        if !info.pv.is_empty() {
            latest.pv = info.pv;
        }
    }
}

fn outcome(latest: EngineInfo, completed: bool) -> EvaluationOutcome {
    EvaluationOutcome {
        score: latest.score,
        depth: latest.depth,
        pv: latest.pv,
        completed,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chess::{format_uci_move, AnalysisScore, STARTING_FEN};

    use super::*;
    use crate::testing::MockEngine;

    fn fast() -> EngineTimeouts {
        EngineTimeouts {
            handshake_ms: 2_000,
            move_grace_ms: 300,
            single_node_ms: 1_000,
            evaluation_max_ms: 5_000,
            drain_ms: 300,
            stop_grace_ms: 200,
        }
    }

    fn startpos() -> SearchPosition {
        SearchPosition::new(STARTING_FEN, vec![])
    }

    #[tokio::test]
    async fn test_start_applies_only_valid_options() {
        let mock = MockEngine::healthy().unwrap();
        let spec = mock
            .spec()
            .with_option("Hash", "64")
            .with_option("Ponder", "true")
            .with_option("Bogus", "1")
            .with_option("Skill Level", "99");

        let engine = EngineHandle::start(&spec, "test", fast()).await.unwrap();
        assert_eq!(engine.name(), "MockFish 1.0");
        assert_eq!(engine.identity().author.as_deref(), Some("Mock Authors"));
        assert_eq!(
            engine.applied_options(),
            &[("Hash".to_string(), OptionValue::Integer(64))]
        );
        assert_eq!(engine.readiness(), Readiness::Ready);
        assert_eq!(engine.common_options().len(), 4);

        engine.stop().await;
        let commands = mock.commands();
        assert!(commands.contains(&"setoption name Hash value 64".to_string()));
        assert!(!commands.iter().any(|c| c.contains("Ponder")));
        assert!(!commands.iter().any(|c| c.contains("Skill Level")));
    }

    #[tokio::test]
    async fn test_request_move() {
        let mock = MockEngine::builder().best_move("g1f3").score_cp(40).build().unwrap();
        let engine = EngineHandle::start(&mock.spec(), "test", fast()).await.unwrap();

        let position = SearchPosition::new(STARTING_FEN, vec!["e2e4".into(), "e7e5".into()]);
        let result = engine
            .request_move(&position, SearchLimit::MoveTime(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(format_uci_move(result.best_move), "g1f3");
        assert_eq!(result.score, Some(AnalysisScore::Centipawns(40)));
        assert_eq!(engine.readiness(), Readiness::Ready);

        engine.stop().await;
        let commands = mock.commands();
        assert!(commands.contains(&"position startpos moves e2e4 e7e5".to_string()));
        assert!(commands.contains(&"go movetime 100".to_string()));
    }

    #[tokio::test]
    async fn test_single_node_search() {
        let mock = MockEngine::healthy().unwrap();
        let engine = EngineHandle::start(&mock.spec(), "test", fast()).await.unwrap();
        engine
            .request_move(&startpos(), SearchLimit::SingleNode)
            .await
            .unwrap();
        engine.stop().await;
        assert!(mock.commands().contains(&"go nodes 1".to_string()));
    }

    #[tokio::test]
    async fn test_silent_handshake_is_launch_error() {
        let mock = MockEngine::builder().silent_handshake().build().unwrap();
        let timeouts = EngineTimeouts {
            handshake_ms: 200,
            ..fast()
        };
        let err = EngineHandle::start(&mock.spec(), "test", timeouts)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_error() {
        let spec = EngineSpec::new("/nonexistent/engine-binary");
        let err = EngineHandle::start(&spec, "test", fast()).await.err().unwrap();
        assert!(matches!(err, EngineError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_hung_search_times_out() {
        let mock = MockEngine::builder().hang_on_search(1).build().unwrap();
        let engine = EngineHandle::start(&mock.spec(), "test", fast()).await.unwrap();

        let err = engine
            .request_move(&startpos(), SearchLimit::MoveTime(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
        assert_eq!(engine.readiness(), Readiness::Faulted);

        // The wedged process is not trusted with another search.
        let err = engine
            .request_move(&startpos(), SearchLimit::SingleNode)
            .await
            .unwrap_err();
        assert!(err.needs_restart());
        assert_eq!(mock.searches(), 1);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_crash_during_search() {
        let mock = MockEngine::builder().crash_on_search(1).build().unwrap();
        let engine = EngineHandle::start(&mock.spec(), "test", fast()).await.unwrap();
        let err = engine
            .request_move(&startpos(), SearchLimit::SingleNode)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Crashed));
        assert_eq!(engine.readiness(), Readiness::Faulted);
    }

    #[tokio::test]
    async fn test_no_legal_move() {
        let mock = MockEngine::builder().best_move("(none)").build().unwrap();
        let engine = EngineHandle::start(&mock.spec(), "test", fast()).await.unwrap();
        let err = engine
            .request_move(&startpos(), SearchLimit::SingleNode)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoMove));
        assert_eq!(engine.readiness(), Readiness::Ready);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_evaluation_until_cancelled() {
        let mock = MockEngine::builder().score_mate(2).build().unwrap();
        let engine = EngineHandle::start(&mock.spec(), "test", fast()).await.unwrap();

        let mut progress = 0;
        let outcome = engine
            .request_evaluation(
                &startpos(),
                tokio::time::sleep(Duration::from_millis(150)),
                |_| progress += 1,
            )
            .await
            .unwrap();
        assert_eq!(outcome.score, Some(AnalysisScore::Mate(2)));
        assert!(!outcome.completed);
        assert!(progress >= 1);
        assert_eq!(engine.readiness(), Readiness::Ready);

        engine.stop().await;
        let commands = mock.commands();
        assert!(commands.contains(&"go infinite".to_string()));
        assert!(commands.contains(&"stop".to_string()));
    }

    #[tokio::test]
    async fn test_abandoned_evaluation_is_drained() {
        let mock = MockEngine::healthy().unwrap();
        let engine = EngineHandle::start(&mock.spec(), "test", fast()).await.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            engine.request_evaluation(&startpos(), std::future::pending(), |_| {}),
        )
        .await;
        assert!(abandoned.is_err());

        let result = engine
            .request_move(&startpos(), SearchLimit::SingleNode)
            .await
            .unwrap();
        assert_eq!(format_uci_move(result.best_move), "e2e4");
        engine.stop().await;

        let commands = mock.commands();
        let stop = commands.iter().position(|c| c == "stop").unwrap();
        let go = commands.iter().rposition(|c| c == "go nodes 1").unwrap();
        assert!(stop < go);
    }

    #[tokio::test]
    async fn test_new_game() {
        let mock = MockEngine::healthy().unwrap();
        let engine = EngineHandle::start(&mock.spec(), "test", fast()).await.unwrap();
        engine.new_game().await.unwrap();
        engine.stop().await;
        assert!(mock.commands().contains(&"ucinewgame".to_string()));
    }

    #[tokio::test]
    async fn test_stop_kills_engine_ignoring_quit() {
        let mock = MockEngine::builder().ignore_quit().build().unwrap();
        let engine = EngineHandle::start(&mock.spec(), "test", fast()).await.unwrap();
        engine.stop().await;
        engine.stop().await;
        assert_eq!(engine.readiness(), Readiness::Stopped);

        let err = engine
            .request_move(&startpos(), SearchLimit::SingleNode)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotRunning));
    }
}
