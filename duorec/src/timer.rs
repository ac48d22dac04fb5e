//! Session timer: phase/countdown state machine for one recorded segment.
//!
//! The state machine itself is [`step`], a pure function from one state to
//! the next plus the events the transition produced. [`TimerEngine`] owns the
//! state, schedules one step per tick period and publishes the events.

use crate::error::TimerError;
use crate::notifier::SharedNotifier;
use crate::store::SessionStore;
use chrono::Utc;
use duorec_ipc::{
    ModeChange, StopReason, TimerConfig, TimerMode, TimerPhase, TimerStartPayload, TimerState,
};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const DEFAULT_CONFIG: TimerConfig = TimerConfig {
    duration_sec: 360,
    intro_sec: 3,
    outro_sec: 5,
    interval_sec: 60,
    break_length_sec: 300,
};

/// Clamps a raw start request: each field floored to a non-negative
/// integer, missing or non-finite fields fall back to [`DEFAULT_CONFIG`].
pub fn normalize_config(payload: Option<&TimerStartPayload>) -> TimerConfig {
    let p = payload.cloned().unwrap_or_default();
    TimerConfig {
        duration_sec: sanitize(p.duration_sec, DEFAULT_CONFIG.duration_sec),
        intro_sec: sanitize(p.intro_sec, DEFAULT_CONFIG.intro_sec),
        outro_sec: sanitize(p.outro_sec, DEFAULT_CONFIG.outro_sec),
        interval_sec: sanitize(p.interval_sec, DEFAULT_CONFIG.interval_sec),
        break_length_sec: sanitize(p.break_length_sec, DEFAULT_CONFIG.break_length_sec),
    }
}

fn sanitize(value: Option<f64>, fallback: u64) -> u64 {
    match value {
        Some(v) if v.is_finite() => v.max(0.0).floor() as u64,
        _ => fallback,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    Phase {
        phase: TimerPhase,
        remaining: u64,
    },
    Tick {
        phase: TimerPhase,
        elapsed_sec: u64,
        remaining_sec: u64,
    },
    /// The countdown reached zero; the run should stop as completed.
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub state: TimerState,
    pub events: Vec<TimerEvent>,
}

fn tick_event(state: &TimerState) -> TimerEvent {
    TimerEvent::Tick {
        phase: state.phase,
        elapsed_sec: state.elapsed_sec,
        remaining_sec: state.remaining_sec,
    }
}

/// Advances `state` by one second.
///
/// Up mode counts elapsed time without bound (overtime keeps counting,
/// remaining stays at zero). Down mode clamps at the duration, enters
/// `outro` once the remaining time is within the outro window, and reports
/// [`TimerEvent::Finished`] at zero, preceded by a `completed` phase event
/// when the run has an outro.
pub fn step(state: &TimerState) -> Result<Step, TimerError> {
    let config = state.config.ok_or(TimerError::NoActiveRun)?;
    let mut next = state.clone();
    let mut events = Vec::new();

    match next.phase {
        TimerPhase::Idle | TimerPhase::Completed => return Err(TimerError::NoActiveRun),
        TimerPhase::Intro => {
            next.intro_remaining = next.intro_remaining.saturating_sub(1);
            events.push(TimerEvent::Phase {
                phase: TimerPhase::Intro,
                remaining: next.intro_remaining,
            });
            if next.intro_remaining == 0 {
                next.phase = TimerPhase::Running;
                next.elapsed_sec = 0;
                next.remaining_sec = config.duration_sec;
                events.push(TimerEvent::Phase {
                    phase: TimerPhase::Running,
                    remaining: next.remaining_sec,
                });
                events.push(tick_event(&next));
            }
        }
        TimerPhase::Running | TimerPhase::Outro => match next.mode {
            TimerMode::Up => {
                next.elapsed_sec = next.elapsed_sec.checked_add(1).ok_or(TimerError::Overflow)?;
                next.remaining_sec = config.duration_sec.saturating_sub(next.elapsed_sec);
                events.push(tick_event(&next));
            }
            TimerMode::Down => {
                next.elapsed_sec = next.elapsed_sec.saturating_add(1).min(config.duration_sec);
                next.remaining_sec = config.duration_sec - next.elapsed_sec;
                events.push(tick_event(&next));

                if config.outro_sec > 0
                    && next.remaining_sec > 0
                    && next.remaining_sec <= config.outro_sec
                    && next.phase != TimerPhase::Outro
                {
                    next.phase = TimerPhase::Outro;
                    events.push(TimerEvent::Phase {
                        phase: TimerPhase::Outro,
                        remaining: next.remaining_sec,
                    });
                }
                if next.remaining_sec == 0 {
                    if config.outro_sec > 0 {
                        events.push(TimerEvent::Phase {
                            phase: TimerPhase::Completed,
                            remaining: 0,
                        });
                    }
                    events.push(TimerEvent::Finished);
                }
            }
        },
    }

    Ok(Step {
        state: next,
        events,
    })
}

/// How ticks are produced.
#[derive(Debug, Clone, Copy)]
pub enum TickSource {
    /// A tokio interval with the given period.
    Interval(Duration),
    /// The owner calls [`TimerEngine::tick`] itself.
    Manual,
}

#[derive(Clone)]
pub struct TimerEngine {
    inner: Arc<Mutex<TimerInner>>,
    store: SessionStore,
    notifier: SharedNotifier,
    source: TickSource,
}

struct TimerInner {
    state: TimerState,
    ticker: Option<JoinHandle<()>>,
    /// Bumped on every start/stop so a stale ticker can recognize itself.
    run: u64,
}

impl TimerEngine {
    pub fn new(store: SessionStore, notifier: SharedNotifier, source: TickSource) -> Self {
        let mode = store.get().timer_mode;
        Self {
            inner: Arc::new(Mutex::new(TimerInner {
                state: TimerState {
                    mode,
                    ..TimerState::default()
                },
                ticker: None,
                run: 0,
            })),
            store,
            notifier,
            source,
        }
    }

    /// Starts a new run, replacing any active one.
    ///
    /// With an interval tick source this must be called from within a tokio
    /// runtime.
    pub fn start(&self, payload: Option<TimerStartPayload>) -> TimerState {
        let config = normalize_config(payload.as_ref());
        let mut inner = self.lock();
        cancel_ticker(&mut inner);
        inner.run += 1;

        let mode = inner.state.mode;
        if let Err(e) = self.store.update(|r| {
            r.segment_counter += 1;
            r.timer_mode = mode;
        }) {
            warn!("Failed to persist segment counter: {}", e);
        }

        let now = Utc::now();
        inner.state = TimerState {
            phase: if config.intro_sec > 0 {
                TimerPhase::Intro
            } else {
                TimerPhase::Running
            },
            config: Some(config),
            mode,
            elapsed_sec: 0,
            remaining_sec: config.duration_sec,
            intro_remaining: config.intro_sec,
            started_at: Some(now.timestamp_millis()),
            stopped_at: None,
        };
        info!(
            duration = config.duration_sec,
            intro = config.intro_sec,
            outro = config.outro_sec,
            %mode,
            "timer started"
        );

        self.notifier.publish(
            "timer/start",
            json!({
                "phase": inner.state.phase,
                "config": config,
                "mode": mode,
                "startedAt": now.to_rfc3339(),
            }),
        );
        if inner.state.phase == TimerPhase::Intro {
            self.publish_phase(TimerPhase::Intro, inner.state.intro_remaining, mode);
        } else {
            self.publish_phase(TimerPhase::Running, inner.state.remaining_sec, mode);
            self.publish_tick(&tick_event(&inner.state), mode);
        }

        if let TickSource::Interval(period) = self.source {
            let engine = self.clone();
            let run = inner.run;
            inner.ticker = Some(tokio::spawn(async move {
                let mut interval = interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if !engine.tick_run(run) {
                        break;
                    }
                }
            }));
        }

        inner.state.clone()
    }

    pub fn stop(&self, reason: StopReason) -> TimerState {
        let mut inner = self.lock();
        self.stop_locked(&mut inner, reason);
        inner.state.clone()
    }

    /// `stop(Aborted)` followed by a return to the zero/idle state.
    pub fn reset(&self) -> TimerState {
        let mut inner = self.lock();
        self.stop_locked(&mut inner, StopReason::Aborted);
        inner.state = TimerState {
            mode: inner.state.mode,
            ..TimerState::default()
        };
        inner.state.clone()
    }

    pub fn status(&self) -> TimerState {
        self.lock().state.clone()
    }

    pub fn set_mode(&self, mode: &str) -> ModeChange {
        let mut inner = self.lock();
        let current = inner.state.mode;
        let Ok(mode) = mode.parse::<TimerMode>() else {
            return ModeChange {
                success: false,
                mode: current,
            };
        };
        if !matches!(inner.state.phase, TimerPhase::Idle | TimerPhase::Completed) {
            return ModeChange {
                success: false,
                mode: current,
            };
        }
        inner.state.mode = mode;
        if let Err(e) = self.store.update(|r| r.timer_mode = mode) {
            warn!("Failed to persist timer mode: {}", e);
        }
        ModeChange {
            success: true,
            mode,
        }
    }

    /// Runs one step of the active run, if any.
    pub fn tick(&self) {
        let run = self.lock().run;
        self.tick_run(run);
    }

    /// Returns whether the ticker for `run` should keep going.
    fn tick_run(&self, run: u64) -> bool {
        let mut inner = self.lock();
        if inner.run != run || inner.state.config.is_none() {
            return false;
        }
        if !matches!(
            inner.state.phase,
            TimerPhase::Intro | TimerPhase::Running | TimerPhase::Outro
        ) {
            return false;
        }

        let step = match step(&inner.state) {
            Ok(step) => step,
            Err(e) => {
                error!("timer tick failed: {}", e);
                self.stop_locked(&mut inner, StopReason::Aborted);
                return false;
            }
        };

        inner.state = step.state;
        let mode = inner.state.mode;
        let mut finished = false;
        for event in &step.events {
            match event {
                TimerEvent::Phase { phase, remaining } => self.publish_phase(*phase, *remaining, mode),
                TimerEvent::Tick { .. } => self.publish_tick(event, mode),
                TimerEvent::Finished => finished = true,
            }
        }
        if finished {
            self.stop_locked(&mut inner, StopReason::Completed);
            return false;
        }
        true
    }

    fn stop_locked(&self, inner: &mut TimerInner, reason: StopReason) {
        cancel_ticker(inner);
        inner.run += 1;
        if inner.state.config.is_none() {
            return;
        }

        let now = Utc::now();
        inner.state.stopped_at = Some(now.timestamp_millis());
        inner.state.phase = if reason == StopReason::Completed {
            TimerPhase::Completed
        } else {
            TimerPhase::Idle
        };
        info!(?reason, elapsed = inner.state.elapsed_sec, "timer stopped");

        self.notifier.publish(
            "timer/stop",
            json!({
                "reason": reason,
                "stoppedAt": now.to_rfc3339(),
                "elapsedSec": inner.state.elapsed_sec,
                "remainingSec": inner.state.remaining_sec,
                "phase": inner.state.phase,
                "mode": inner.state.mode,
            }),
        );
    }

    fn publish_phase(&self, phase: TimerPhase, remaining: u64, mode: TimerMode) {
        debug!(?phase, remaining, "timer phase");
        self.notifier.publish(
            "timer/phase",
            json!({ "phase": phase, "remaining": remaining, "mode": mode }),
        );
    }

    fn publish_tick(&self, event: &TimerEvent, mode: TimerMode) {
        if let TimerEvent::Tick {
            phase,
            elapsed_sec,
            remaining_sec,
        } = event
        {
            self.notifier.publish(
                "timer/tick",
                json!({
                    "phase": phase,
                    "elapsedSec": elapsed_sec,
                    "remainingSec": remaining_sec,
                    "timestamp": Utc::now().to_rfc3339(),
                    "mode": mode,
                }),
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn cancel_ticker(inner: &mut TimerInner) {
    if let Some(handle) = inner.ticker.take() {
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::MemoryNotifier;
    use duorec_ipc::SessionRecord;

    fn payload(duration: f64, intro: f64, outro: f64) -> TimerStartPayload {
        TimerStartPayload {
            duration_sec: Some(duration),
            intro_sec: Some(intro),
            outro_sec: Some(outro),
            ..Default::default()
        }
    }

    fn manual_engine(mode: TimerMode) -> (TimerEngine, Arc<MemoryNotifier>, SessionStore) {
        let store = SessionStore::in_memory(SessionRecord {
            timer_mode: mode,
            ..SessionRecord::default()
        });
        let notifier = Arc::new(MemoryNotifier::new());
        let engine = TimerEngine::new(store.clone(), notifier.clone(), TickSource::Manual);
        (engine, notifier, store)
    }

    fn phase_rank(phase: TimerPhase) -> u8 {
        match phase {
            TimerPhase::Idle => 0,
            TimerPhase::Intro => 1,
            TimerPhase::Running => 2,
            TimerPhase::Outro => 3,
            TimerPhase::Completed => 4,
        }
    }

    #[test]
    fn normalize_clamps_floors_and_defaults() {
        let config = normalize_config(Some(&TimerStartPayload {
            duration_sec: Some(90.9),
            intro_sec: Some(-4.0),
            outro_sec: Some(f64::NAN),
            interval_sec: None,
            break_length_sec: Some(f64::INFINITY),
        }));
        assert_eq!(config.duration_sec, 90);
        assert_eq!(config.intro_sec, 0);
        assert_eq!(config.outro_sec, DEFAULT_CONFIG.outro_sec);
        assert_eq!(config.interval_sec, DEFAULT_CONFIG.interval_sec);
        assert_eq!(config.break_length_sec, DEFAULT_CONFIG.break_length_sec);
        assert_eq!(normalize_config(None), DEFAULT_CONFIG);
    }

    #[test]
    fn step_without_config_is_an_error() {
        let state = TimerState {
            phase: TimerPhase::Running,
            ..TimerState::default()
        };
        assert_eq!(step(&state), Err(TimerError::NoActiveRun));
    }

    #[test]
    fn elapsed_plus_remaining_is_duration_and_phase_never_regresses() {
        for duration in [0u64, 1, 2, 7, 30] {
            for intro in [0u64, 1, 3] {
                for outro in [0u64, 1, 5, 40] {
                    let config = TimerConfig {
                        duration_sec: duration,
                        intro_sec: intro,
                        outro_sec: outro,
                        ..DEFAULT_CONFIG
                    };
                    let mut state = TimerState {
                        phase: if intro > 0 {
                            TimerPhase::Intro
                        } else {
                            TimerPhase::Running
                        },
                        config: Some(config),
                        mode: TimerMode::Down,
                        remaining_sec: duration,
                        intro_remaining: intro,
                        ..TimerState::default()
                    };
                    for _ in 0..(intro + duration + 2) {
                        let Ok(next) = step(&state) else { break };
                        assert!(phase_rank(next.state.phase) >= phase_rank(state.phase));
                        if matches!(next.state.phase, TimerPhase::Running | TimerPhase::Outro) {
                            assert_eq!(
                                next.state.elapsed_sec + next.state.remaining_sec,
                                duration
                            );
                        }
                        let done = next.events.contains(&TimerEvent::Finished);
                        state = next.state;
                        if done {
                            break;
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn up_mode_keeps_the_sum_within_the_duration() {
        let mut state = TimerState {
            phase: TimerPhase::Running,
            config: Some(TimerConfig {
                duration_sec: 5,
                ..DEFAULT_CONFIG
            }),
            mode: TimerMode::Up,
            remaining_sec: 5,
            ..TimerState::default()
        };
        for _ in 0..5 {
            state = step(&state).unwrap().state;
            assert_eq!(state.elapsed_sec + state.remaining_sec, 5);
            assert_eq!(state.phase, TimerPhase::Running);
        }
        // Overtime: counting continues, nothing finishes on its own.
        let over = step(&state).unwrap();
        assert_eq!(over.state.elapsed_sec, 6);
        assert_eq!(over.state.remaining_sec, 0);
        assert!(!over.events.contains(&TimerEvent::Finished));
    }

    #[test]
    fn start_broadcasts_start_then_intro_phase() {
        let (engine, notifier, store) = manual_engine(TimerMode::Down);
        let state = engine.start(Some(payload(10.0, 2.0, 3.0)));

        assert_eq!(state.phase, TimerPhase::Intro);
        assert_eq!(state.intro_remaining, 2);
        assert_eq!(store.get().segment_counter, 1);

        let channels: Vec<_> = notifier.events().into_iter().map(|e| e.channel).collect();
        assert_eq!(channels, vec!["timer/start", "timer/phase"]);
        assert_eq!(notifier.channel("timer/phase")[0]["phase"], "intro");
    }

    #[test]
    fn start_without_intro_goes_straight_to_running_with_a_tick() {
        let (engine, notifier, _) = manual_engine(TimerMode::Down);
        let state = engine.start(Some(payload(10.0, 0.0, 0.0)));

        assert_eq!(state.phase, TimerPhase::Running);
        let channels: Vec<_> = notifier.events().into_iter().map(|e| e.channel).collect();
        assert_eq!(channels, vec!["timer/start", "timer/phase", "timer/tick"]);
        assert_eq!(notifier.channel("timer/tick")[0]["remainingSec"], 10);
    }

    #[test]
    fn full_countdown_scenario() {
        let (engine, notifier, _) = manual_engine(TimerMode::Down);
        engine.start(Some(payload(10.0, 2.0, 3.0)));

        for _ in 0..2 {
            engine.tick();
        }
        let state = engine.status();
        assert_eq!(state.phase, TimerPhase::Running);
        assert_eq!(state.remaining_sec, 10);

        for _ in 0..7 {
            engine.tick();
        }
        let state = engine.status();
        assert_eq!(state.remaining_sec, 3);
        assert_eq!(state.phase, TimerPhase::Outro);

        for _ in 0..3 {
            engine.tick();
        }
        let state = engine.status();
        assert_eq!(state.phase, TimerPhase::Completed);
        assert_eq!(state.remaining_sec, 0);
        assert_eq!(state.elapsed_sec, 10);
        assert!(state.stopped_at.is_some());

        let stops = notifier.channel("timer/stop");
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0]["reason"], "completed");

        let tail: Vec<_> = notifier
            .events()
            .into_iter()
            .rev()
            .take(3)
            .map(|e| (e.channel, e.payload["phase"].clone()))
            .collect();
        assert_eq!(
            tail,
            vec![
                ("timer/stop".to_string(), json!("completed")),
                ("timer/phase".to_string(), json!("completed")),
                ("timer/tick".to_string(), json!("outro")),
            ]
        );
        assert_eq!(notifier.channel("timer/phase").last().unwrap()["remaining"], 0);

        // Auto-stopped: further ticks change nothing.
        notifier.clear();
        engine.tick();
        assert!(notifier.events().is_empty());
        assert_eq!(engine.status().phase, TimerPhase::Completed);
    }

    #[test]
    fn set_mode_rejected_outside_idle_and_completed() {
        let (engine, _, store) = manual_engine(TimerMode::Down);
        assert!(engine.set_mode("up").success);
        assert_eq!(store.get().timer_mode, TimerMode::Up);
        assert!(engine.set_mode("down").success);

        engine.start(Some(payload(4.0, 1.0, 1.0)));
        let mut seen = Vec::new();
        loop {
            let phase = engine.status().phase;
            if !seen.contains(&phase) {
                seen.push(phase);
            }
            let change = engine.set_mode("up");
            if matches!(phase, TimerPhase::Idle | TimerPhase::Completed) {
                assert!(change.success);
                break;
            }
            assert!(!change.success);
            assert_eq!(change.mode, TimerMode::Down);
            engine.tick();
        }
        assert_eq!(
            seen,
            vec![
                TimerPhase::Intro,
                TimerPhase::Running,
                TimerPhase::Outro,
                TimerPhase::Completed
            ]
        );
        assert!(!engine.set_mode("sideways").success);
    }

    #[test]
    fn countdown_without_outro_has_no_completed_phase_event() {
        let (engine, notifier, _) = manual_engine(TimerMode::Down);
        engine.start(Some(payload(2.0, 0.0, 0.0)));
        engine.tick();
        engine.tick();

        assert_eq!(engine.status().phase, TimerPhase::Completed);
        assert!(notifier
            .channel("timer/phase")
            .iter()
            .all(|p| p["phase"] != "completed"));
        assert_eq!(notifier.channel("timer/stop").len(), 1);
    }

    #[test]
    fn stopping_a_completed_run_reports_it_and_goes_idle() {
        let (engine, notifier, _) = manual_engine(TimerMode::Down);
        engine.start(Some(payload(1.0, 0.0, 0.0)));
        engine.tick();
        assert_eq!(engine.status().phase, TimerPhase::Completed);

        let state = engine.stop(StopReason::Manual);
        assert_eq!(state.phase, TimerPhase::Idle);
        let stops = notifier.channel("timer/stop");
        assert_eq!(stops.len(), 2);
        assert_eq!(stops[1]["reason"], "manual");
        assert_eq!(stops[1]["phase"], "idle");
        assert_eq!(stops[1]["remainingSec"], 0);
        assert!(engine.set_mode("up").success);
    }

    #[test]
    fn stop_without_run_is_a_quiet_no_op() {
        let (engine, notifier, _) = manual_engine(TimerMode::Up);
        let state = engine.stop(StopReason::Manual);
        assert_eq!(state.phase, TimerPhase::Idle);
        assert!(notifier.events().is_empty());
    }

    #[test]
    fn reset_stops_as_aborted_and_zeroes_state() {
        let (engine, notifier, _) = manual_engine(TimerMode::Down);
        engine.start(Some(payload(10.0, 0.0, 0.0)));
        engine.tick();

        let state = engine.reset();
        assert_eq!(state.phase, TimerPhase::Idle);
        assert_eq!(state.config, None);
        assert_eq!(state.elapsed_sec, 0);
        assert_eq!(state.mode, TimerMode::Down);
        assert_eq!(notifier.channel("timer/stop")[0]["reason"], "aborted");
    }

    #[tokio::test(start_paused = true)]
    async fn interval_ticker_runs_to_completion() {
        let store = SessionStore::in_memory(SessionRecord {
            timer_mode: TimerMode::Down,
            ..SessionRecord::default()
        });
        let notifier = Arc::new(MemoryNotifier::new());
        let engine = TimerEngine::new(
            store,
            notifier.clone(),
            TickSource::Interval(Duration::from_secs(1)),
        );

        engine.start(Some(payload(3.0, 1.0, 0.0)));
        tokio::time::sleep(Duration::from_millis(4500)).await;

        assert_eq!(engine.status().phase, TimerPhase::Completed);
        assert_eq!(notifier.channel("timer/stop").len(), 1);
        assert!(engine.lock().ticker.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_the_scheduled_ticks() {
        let (store, notifier) = (
            SessionStore::in_memory(SessionRecord::default()),
            Arc::new(MemoryNotifier::new()),
        );
        let engine = TimerEngine::new(
            store,
            notifier.clone(),
            TickSource::Interval(Duration::from_secs(1)),
        );

        engine.start(Some(payload(60.0, 0.0, 0.0)));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        engine.stop(StopReason::Manual);
        let elapsed = engine.status().elapsed_sec;
        assert_eq!(elapsed, 2);

        notifier.clear();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(notifier.events().is_empty());
        assert_eq!(engine.status().elapsed_sec, elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_the_previous_ticker() {
        let notifier = Arc::new(MemoryNotifier::new());
        let engine = TimerEngine::new(
            SessionStore::in_memory(SessionRecord::default()),
            notifier.clone(),
            TickSource::Interval(Duration::from_secs(1)),
        );

        engine.start(Some(payload(60.0, 0.0, 0.0)));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        engine.start(Some(payload(60.0, 0.0, 0.0)));
        tokio::time::sleep(Duration::from_millis(1200)).await;

        // One tick since the restart, not two interleaved tickers.
        assert_eq!(engine.status().elapsed_sec, 1);
        engine.stop(StopReason::Manual);
    }
}
