//! Command backlog smoothing ("antiwarp")
//!
//! Clients on a bursty connection deliver several commands at once. Running
//! them all in the same tick makes the player jump across the map for
//! everyone else. Instead, every command is queued and each tick drains only
//! as much movement time as the player's credit allows, splitting commands
//! that would overshoot it.
//!
//! Credit is tracked as `cmd_delta`: movement time consumed and not yet paid
//! back by wall-clock time. A tick may consume until `cmd_delta` reaches
//! `max_delta`.

use crate::config::{AntiwarpTuning, ServerConfig};
use log::{debug, trace};
use shared::{MoveFlags, Team, UserCmd, CMD_MOVE_MAX};

pub const MAX_QUEUED_COMMANDS: usize = 64;

/// The movement side of a player, as seen by the drain
pub trait CommandSink {
    /// Time of the last command the movement processor ran
    fn command_time(&self) -> i32;

    fn set_command_time(&mut self, time: i32);

    /// Current horizontal and vertical speed in units per second
    fn speed(&self) -> f32;

    fn in_water(&self) -> bool;

    /// Runs one command through the movement processor. Afterwards
    /// `command_time()` must equal `cmd.server_time`.
    fn think(&mut self, cmd: &UserCmd);
}

/// What happened during one drain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Whole commands run and popped
    pub processed: u32,
    /// Partial slices submitted for commands that stay queued
    pub split: u32,
    pub dropped: u32,
    pub final_drop_threshold: i32,
    /// Server time of the newest queued command at the start of the drain
    pub latest_time: i32,
    /// How far the simulation trails the newest command, floored at zero
    pub delay: i32,
}

/// Fixed-capacity FIFO of commands plus the owner's movement credit
#[derive(Debug, Clone)]
pub struct CommandQueue<const M: usize = MAX_QUEUED_COMMANDS> {
    cmds: [UserCmd; M],
    head: usize,
    count: usize,
    cmd_delta: f32,
    last_real_time: Option<i32>,
}

impl<const M: usize> Default for CommandQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const M: usize> CommandQueue<M> {
    pub fn new() -> Self {
        Self {
            cmds: [UserCmd::default(); M],
            head: 0,
            count: 0,
            cmd_delta: 0.0,
            last_real_time: None,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn front(&self) -> Option<&UserCmd> {
        (self.count > 0).then(|| &self.cmds[self.head])
    }

    pub fn back(&self) -> Option<&UserCmd> {
        (self.count > 0).then(|| &self.cmds[(self.head + self.count - 1) % M])
    }

    /// Movement time that can still be consumed this tick
    pub fn available_credit(&self, tuning: &AntiwarpTuning) -> f32 {
        tuning.max_delta - self.cmd_delta
    }

    /// Appends `cmd`, evicting and returning the oldest command when full.
    pub fn enqueue(&mut self, cmd: UserCmd) -> Option<UserCmd> {
        let idx = (self.head + self.count) % M;
        if self.count < M {
            self.cmds[idx] = cmd;
            self.count += 1;
            None
        } else {
            let evicted = self.cmds[self.head];
            self.cmds[idx] = cmd;
            self.head = (self.head + 1) % M;
            trace!(
                "command queue full, dropped command at t={}",
                evicted.server_time
            );
            Some(evicted)
        }
    }

    pub fn pop(&mut self) -> Option<UserCmd> {
        if self.count == 0 {
            return None;
        }
        let cmd = self.cmds[self.head];
        self.head = (self.head + 1) % M;
        self.count -= 1;
        Some(cmd)
    }

    /// Forgets queued commands and spent credit; used on respawn.
    pub fn clear(&mut self) {
        self.head = 0;
        self.count = 0;
        self.cmd_delta = 0.0;
    }

    fn replenish(&mut self, now_real: i32) {
        match self.last_real_time {
            Some(last) if last > now_real => self.cmd_delta = 0.0,
            Some(last) => self.cmd_delta -= now_real.saturating_sub(last) as f32,
            None => {}
        }
        if self.count <= 1 && self.cmd_delta < 0.0 {
            self.cmd_delta = 0.0;
        }
        self.last_real_time = Some(now_real);
    }

    /// Runs as much of the queue through `sink` as this tick's credit allows.
    ///
    /// `now_real` is a wall-clock millisecond counter, not level time.
    pub fn drain<S: CommandSink>(
        &mut self,
        now_real: i32,
        tuning: &AntiwarpTuning,
        fixed_step: Option<i32>,
        sink: &mut S,
    ) -> DrainReport {
        let mut report = DrainReport {
            final_drop_threshold: tuning.max_drop_threshold,
            ..Default::default()
        };

        let latest_time = match self.back() {
            Some(cmd) => cmd.server_time,
            None => return report,
        };
        report.latest_time = latest_time;

        self.replenish(now_real);

        let mut drop_threshold = tuning.max_drop_threshold;
        let mut last_time = sink.command_time();
        let decay_scale = 1.0 / tuning.decay;

        while self.count > 0 {
            let cmd = self.cmds[self.head];
            let total_delta = latest_time.saturating_sub(cmd.server_time);

            let server_time = match fixed_step {
                Some(step) => round_up_to_step(cmd.server_time, step),
                None => cmd.server_time,
            };
            let mut time_delta = server_time.saturating_sub(last_time);

            if total_delta >= drop_threshold {
                // too far behind; skip ahead and be stricter for the rest of this drain
                drop_threshold = tuning.min_drop_threshold;
                sink.set_command_time(cmd.server_time);
                last_time = cmd.server_time;
                debug!(
                    "dropped command {}ms behind newest (t={})",
                    total_delta, cmd.server_time
                );
                self.pop();
                report.dropped += 1;
                continue;
            }

            if total_delta < 0 || time_delta <= 0 {
                trace!(
                    "dropped out-of-order command t={} (last {})",
                    cmd.server_time,
                    last_time
                );
                self.pop();
                report.dropped += 1;
                continue;
            }

            let mut speed = command_scale(&cmd, sink.in_water());
            // a player who stopped pressing keys but is still sliding stays smoothed
            if speed == 0.0 && sink.speed() > tuning.speed_threshold {
                speed = 1.0;
            }

            let mut partial = false;
            if time_delta > tuning.max_command_msec {
                time_delta = tuning.max_command_msec;
                partial = true;
            }
            let mut delta = speed * time_delta as f32 * decay_scale;

            if self.cmd_delta + delta >= tuning.max_delta {
                // fits into the next tick: wait for it
                if delta < tuning.max_delta
                    && (total_delta as f32 + delta) < tuning.min_drop_threshold as f32
                {
                    break;
                }

                if speed <= 0.0 {
                    break;
                }
                let budget = tuning.max_delta - self.cmd_delta;
                // rounding up prefers running slightly fast over stalling
                time_delta = (budget / speed).ceil() as i32;
                if time_delta < 1 {
                    break;
                }
                delta = time_delta as f32 * speed * decay_scale;
                partial = true;
            }

            self.cmd_delta += delta;

            sink.set_command_time(last_time);
            if partial {
                let mut slice = cmd;
                slice.server_time = last_time.saturating_add(time_delta);
                sink.think(&slice);
                last_time = sink.command_time();
                report.split += 1;

                if delta <= tuning.split_epsilon {
                    break;
                }
                continue;
            }

            sink.think(&cmd);
            last_time = sink.command_time();
            self.pop();
            report.processed += 1;
        }

        report.final_drop_threshold = drop_threshold;
        report.delay = latest_time.saturating_sub(sink.command_time()).max(0);
        report
    }
}

/// Rounds a command time up to the next multiple of `step`
fn round_up_to_step(time: i32, step: i32) -> i32 {
    if step <= 0 {
        return time;
    }
    time.saturating_add(step - 1).div_euclid(step).saturating_mul(step)
}

/// Normalized movement magnitude of a command, 0..=1
///
/// Jump and crouch do not count unless swimming.
pub fn command_scale(cmd: &UserCmd, in_water: bool) -> f32 {
    let mut scale = (cmd.forward_move as i32)
        .abs()
        .max((cmd.right_move as i32).abs());
    if in_water {
        scale = scale.max((cmd.up_move as i32).abs());
    }
    (scale as f32 / CMD_MOVE_MAX).min(1.0)
}

/// Whether a client's commands go through the queue at all
pub fn wants_antiwarp(
    config: &ServerConfig,
    intermission: bool,
    team: Team,
    pm_flags: MoveFlags,
    is_bot: bool,
    connected_for: i32,
) -> bool {
    if !config.antiwarp || intermission {
        return false;
    }
    if team == Team::Spectator || pm_flags.contains(MoveFlags::LIMBO) {
        return false;
    }
    !is_bot && connected_for >= config.antiwarp_tuning.warmup_msec
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    /// Records every command it is asked to run
    #[derive(Default)]
    struct RecordingSink {
        command_time: i32,
        speed: f32,
        water: bool,
        ran: Vec<UserCmd>,
    }

    impl CommandSink for RecordingSink {
        fn command_time(&self) -> i32 {
            self.command_time
        }

        fn set_command_time(&mut self, time: i32) {
            self.command_time = time;
        }

        fn speed(&self) -> f32 {
            self.speed
        }

        fn in_water(&self) -> bool {
            self.water
        }

        fn think(&mut self, cmd: &UserCmd) {
            self.command_time = cmd.server_time;
            self.ran.push(*cmd);
        }
    }

    fn moving(server_time: i32) -> UserCmd {
        let mut cmd = UserCmd::new(server_time);
        cmd.forward_move = 127;
        cmd
    }

    fn flat_tuning() -> AntiwarpTuning {
        AntiwarpTuning {
            decay: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_enqueue_evicts_oldest_when_full() {
        let mut queue = CommandQueue::<3>::new();
        for t in [10, 20, 30] {
            assert!(queue.enqueue(UserCmd::new(t)).is_none());
        }
        let evicted = queue.enqueue(UserCmd::new(40)).unwrap();
        assert_eq!(evicted.server_time, 10);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.front().unwrap().server_time, 20);
        assert_eq!(queue.back().unwrap().server_time, 40);
    }

    #[test]
    fn test_pop_preserves_order() {
        let mut queue = CommandQueue::<4>::new();
        for t in 1..=6 {
            queue.enqueue(UserCmd::new(t));
        }
        let order: Vec<i32> = std::iter::from_fn(|| queue.pop())
            .map(|c| c.server_time)
            .collect();
        assert_eq!(order, vec![3, 4, 5, 6]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_command_scale() {
        let mut cmd = UserCmd::new(0);
        assert_eq!(command_scale(&cmd, false), 0.0);

        cmd.right_move = -127;
        assert_approx_eq!(command_scale(&cmd, false), 1.0, 1e-6);

        let mut cmd = UserCmd::new(0);
        cmd.up_move = 127;
        assert_eq!(command_scale(&cmd, false), 0.0);
        assert_approx_eq!(command_scale(&cmd, true), 1.0, 1e-6);
    }

    #[test]
    fn test_drain_runs_commands_within_credit() {
        let tuning = flat_tuning();
        let mut queue = CommandQueue::<8>::new();
        queue.enqueue(moving(1016));
        queue.enqueue(moving(1032));

        let mut sink = RecordingSink {
            command_time: 1000,
            ..Default::default()
        };
        let report = queue.drain(0, &tuning, None, &mut sink);

        assert_eq!(report.processed, 2);
        assert_eq!(report.split, 0);
        assert_eq!(sink.command_time, 1032);
        assert_eq!(report.delay, 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_split_consumes_exactly_available_credit() {
        let tuning = AntiwarpTuning {
            max_delta: 30.0,
            decay: 1.0,
            ..Default::default()
        };
        let mut queue = CommandQueue::<8>::new();
        // costs 39 against a budget of 30
        queue.enqueue(moving(1039));

        let mut sink = RecordingSink {
            command_time: 1000,
            ..Default::default()
        };
        let report = queue.drain(0, &tuning, None, &mut sink);

        assert_eq!(report.split, 1);
        assert_eq!(report.processed, 0);
        assert_eq!(sink.ran.len(), 1);
        assert_eq!(sink.ran[0].server_time, 1030);
        assert_approx_eq!(queue.available_credit(&tuning), 0.0, 1e-4);

        // the remainder stays queued with its original timestamp
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.front().unwrap().server_time, 1039);
        assert_eq!(report.delay, 9);
    }

    #[test]
    fn test_waits_when_command_fits_next_tick() {
        let tuning = flat_tuning();
        let mut queue = CommandQueue::<8>::new();
        for t in [1040, 1080, 1120] {
            queue.enqueue(moving(t));
        }
        let mut sink = RecordingSink {
            command_time: 1000,
            ..Default::default()
        };

        let first = queue.drain(0, &tuning, None, &mut sink);
        assert_eq!(first.processed, 1);
        assert_eq!(queue.len(), 2);

        // 40ms of wall clock pays back exactly one more command
        let second = queue.drain(40, &tuning, None, &mut sink);
        assert_eq!(second.processed, 1);
        assert_eq!(sink.command_time, 1080);
    }

    #[test]
    fn test_long_command_is_capped() {
        let tuning = AntiwarpTuning {
            max_delta: 500.0,
            decay: 1.0,
            ..Default::default()
        };
        let mut queue = CommandQueue::<8>::new();
        queue.enqueue(moving(1120));

        let mut sink = RecordingSink {
            command_time: 1000,
            ..Default::default()
        };
        let report = queue.drain(0, &tuning, None, &mut sink);

        let times: Vec<i32> = sink.ran.iter().map(|c| c.server_time).collect();
        assert_eq!(times, vec![1050, 1100, 1120]);
        assert_eq!(report.split, 2);
        assert_eq!(report.processed, 1);
    }

    #[test]
    fn test_drop_threshold_only_tightens() {
        let tuning = flat_tuning();
        let mut queue = CommandQueue::<64>::new();
        for t in [100, 150, 300, 1000] {
            queue.enqueue(moving(t));
        }

        let mut sink = RecordingSink {
            command_time: 50,
            ..Default::default()
        };
        let report = queue.drain(0, &tuning, None, &mut sink);

        // 900 behind trips the generous threshold, 850 and 700 then trip the tight one
        assert_eq!(report.dropped, 3);
        assert_eq!(report.final_drop_threshold, tuning.min_drop_threshold);

        // the survivor is 700ms ahead, so only one capped slice runs
        assert_eq!(sink.ran.len(), 1);
        assert_eq!(sink.ran[0].server_time, 350);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_out_of_order_and_duplicates_dropped() {
        let tuning = flat_tuning();
        let mut queue = CommandQueue::<8>::new();
        queue.enqueue(moving(990));
        queue.enqueue(moving(1000));
        queue.enqueue(moving(1010));

        let mut sink = RecordingSink {
            command_time: 1000,
            ..Default::default()
        };
        let report = queue.drain(0, &tuning, None, &mut sink);

        assert_eq!(report.dropped, 2);
        assert_eq!(report.processed, 1);
        assert_eq!(sink.command_time, 1010);
    }

    #[test]
    fn test_idle_commands_are_free_unless_sliding() {
        let tuning = AntiwarpTuning {
            max_delta: 20.0,
            decay: 1.0,
            ..Default::default()
        };

        let mut queue = CommandQueue::<8>::new();
        for t in [1040, 1080, 1120] {
            queue.enqueue(UserCmd::new(t));
        }
        let mut idle = RecordingSink {
            command_time: 1000,
            ..Default::default()
        };
        let report = queue.drain(0, &tuning, None, &mut idle);
        assert_eq!(report.processed, 3);

        let mut queue = CommandQueue::<8>::new();
        for t in [1040, 1080, 1120] {
            queue.enqueue(UserCmd::new(t));
        }
        let mut sliding = RecordingSink {
            command_time: 1000,
            speed: 200.0,
            ..Default::default()
        };
        let report = queue.drain(0, &tuning, None, &mut sliding);
        assert!(report.processed < 3);
    }

    #[test]
    fn test_fixed_step_rounds_command_time_up() {
        let tuning = flat_tuning();
        let mut queue = CommandQueue::<8>::new();
        queue.enqueue(moving(1003));

        let mut sink = RecordingSink {
            command_time: 1000,
            ..Default::default()
        };
        // 1003 rounds up to 1008, so the delta is 8 rather than 3
        let before = queue.available_credit(&tuning);
        queue.drain(0, &tuning, Some(8), &mut sink);
        assert_approx_eq!(before - queue.available_credit(&tuning), 8.0, 1e-4);
    }

    #[test]
    fn test_extreme_command_times_do_not_overflow() {
        let tuning = flat_tuning();
        let mut queue = CommandQueue::<8>::new();
        queue.enqueue(moving(i32::MIN + 5));
        queue.enqueue(moving(1000));

        let mut sink = RecordingSink {
            command_time: 0,
            ..Default::default()
        };
        let report = queue.drain(0, &tuning, None, &mut sink);
        assert_eq!(report.dropped, 1);
        assert!(report.split >= 1);
        assert!(sink.ran.iter().all(|cmd| cmd.server_time <= 1000));

        let mut queue = CommandQueue::<8>::new();
        queue.enqueue(moving(i32::MAX - 3));
        let mut sink = RecordingSink {
            command_time: i32::MIN + 1,
            ..Default::default()
        };
        queue.drain(i32::MAX, &tuning, Some(8), &mut sink);
        assert!(sink.ran.len() <= 1);
    }

    #[test]
    fn test_round_up_to_step() {
        assert_eq!(round_up_to_step(1003, 8), 1008);
        assert_eq!(round_up_to_step(1008, 8), 1008);
        assert_eq!(round_up_to_step(-3, 8), 0);
        assert_eq!(round_up_to_step(i32::MAX - 3, 8), i32::MAX - 7);
        assert_eq!(round_up_to_step(42, 0), 42);
    }

    #[test]
    fn test_credit_conservation_without_splits() {
        let tuning = flat_tuning();
        let mut queue = CommandQueue::<64>::new();
        let mut sink = RecordingSink {
            command_time: 0,
            ..Default::default()
        };

        let mut now_real = 0;
        let mut next_cmd = 0;
        for burst in 0..20 {
            for _ in 0..(burst % 4) {
                next_cmd += 16;
                queue.enqueue(moving(next_cmd));
            }
            let before = sink.command_time;
            let credit = queue.available_credit(&tuning) + 50.0;
            let report = queue.drain(now_real, &tuning, None, &mut sink);
            if report.split == 0 {
                assert!((sink.command_time - before) as f32 <= credit);
            }
            now_real += 50;
        }
    }

    #[test]
    fn test_clock_going_backwards_resets_credit() {
        let tuning = flat_tuning();
        let mut queue = CommandQueue::<8>::new();
        queue.enqueue(moving(1030));
        queue.enqueue(moving(1060));
        let mut sink = RecordingSink {
            command_time: 1000,
            ..Default::default()
        };
        queue.drain(1000, &tuning, None, &mut sink);
        queue.drain(500, &tuning, None, &mut sink);
        assert!(queue.available_credit(&tuning) <= tuning.max_delta);
    }

    #[test]
    fn test_wants_antiwarp() {
        let config = ServerConfig::default();
        let warm = config.antiwarp_tuning.warmup_msec;

        assert!(wants_antiwarp(&config, false, Team::Axis, MoveFlags::empty(), false, warm));
        assert!(!wants_antiwarp(&config, true, Team::Axis, MoveFlags::empty(), false, warm));
        assert!(!wants_antiwarp(&config, false, Team::Spectator, MoveFlags::empty(), false, warm));
        assert!(!wants_antiwarp(&config, false, Team::Allies, MoveFlags::LIMBO, false, warm));
        assert!(!wants_antiwarp(&config, false, Team::Allies, MoveFlags::empty(), true, warm));
        assert!(!wants_antiwarp(&config, false, Team::Allies, MoveFlags::empty(), false, warm - 1));

        let disabled = ServerConfig {
            antiwarp: false,
            ..Default::default()
        };
        assert!(!wants_antiwarp(&disabled, false, Team::Axis, MoveFlags::empty(), false, warm));
    }
}
