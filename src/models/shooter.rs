use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::host::{CommandQueue, CommandSink, ObservationSnapshot};
use crate::models::aim::{solve_aim, AimSolution, ReleaseContext};
use crate::models::calibration::CalibrationStore;
use crate::models::common::math_utils;
use crate::models::outcome::{analyze_trajectory, ShotOutcome};
use crate::models::projectile::{AimSample, ProjectileTrack, ShotRelease, TrackStatus};
use crate::models::transform::{Transform, TransformTracker};
use crate::scenario::{AimPolicyConfig, CalibrationConfig, ScenarioConfig};

/// 事前読み込みデータで粗い探索を省略する目標角広がりの閾値（度）
const BOOTSTRAP_SPAN_DEG: f64 = 40.0;

/// 射撃フェーズ
///
/// 照準中（AIMING）と発射シーケンス中（SHOOT）の2状態です。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AimPhase {
    /// 照準解へ向けて回転コマンドを発行中
    Aiming,
    /// 発射チャージを保持し、リリースを待機中
    Shoot,
}

/// ターゲットのモーション領域
///
/// 移動ターゲット向けの先行補正テーブルを使用するかどうかを決めます。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionRegime {
    Static,
    Moving,
}

impl MotionRegime {
    /// シナリオの文字列表現から変換（未知の値はStatic扱い）
    pub fn from_config_str(value: &str) -> Self {
        match value {
            "moving" => MotionRegime::Moving,
            "static" => MotionRegime::Static,
            other => {
                warn!(
                    regime = %other,
                    "REGIME_UNKNOWN: 未知のモーション領域指定のためstaticを使用します"
                );
                MotionRegime::Static
            }
        }
    }
}

/// エージェントごとのセッション統計
///
/// ショット/命中数の累計、粗い段階探索のステップ角、誤差履歴を保持します。
/// エピソード単位のフィールドのみ`reset_episode`でクリアされ、
/// 累計と較正ストアはエピソードをまたいで保存されます。
#[derive(Debug, Clone)]
pub struct ShooterSession {
    pub total_shots: u64,
    pub total_hits: u64,
    pub episode_shots: u64,
    pub episode_hits: u64,
    /// 垂直静的モデルの段階探索ステップ角（度）
    pub vert_step_deg: f64,
    pub vertical_regime: MotionRegime,
    pub horizontal_regime: MotionRegime,
    /// ショットごとの符号付き垂直誤差の履歴（m）
    pub vertical_errors: Vec<f64>,
    /// ショットごとの水平誤差の履歴（m）
    pub horizontal_errors: Vec<f64>,
}

impl ShooterSession {
    pub fn new(initial_step_deg: f64) -> Self {
        Self {
            total_shots: 0,
            total_hits: 0,
            episode_shots: 0,
            episode_hits: 0,
            vert_step_deg: initial_step_deg,
            vertical_regime: MotionRegime::Static,
            horizontal_regime: MotionRegime::Static,
            vertical_errors: Vec::new(),
            horizontal_errors: Vec::new(),
        }
    }

    /// エピソード単位の統計をクリア
    pub fn reset_episode(&mut self) {
        self.episode_shots = 0;
        self.episode_hits = 0;
    }
}

/// 射撃エージェント
///
/// ティックごとに観測を取り込み、照準状態機械を駆動して回転・発射
/// コマンドを発行し、発射体トラックの生成と分析を管理します。
/// 較正ストアを所有し、エピソードをまたいで保持します。
pub struct ShooterAgent {
    name: String,
    target_name: String,
    projectile_name: String,

    policy: AimPolicyConfig,
    calibration: CalibrationConfig,

    self_tracker: TransformTracker,
    target_tracker: TransformTracker,

    tick: u64,
    commands: CommandQueue,
    engaged: bool,

    phase: AimPhase,
    aim_ticks: u32,
    on_target_ticks: u32,
    fire_hold_ticks: u32,
    desired: Option<AimSolution>,
    release_context: ReleaseContext,
    aim_trace: Vec<AimSample>,
    pending_shot: Option<ShotRelease>,
    listening: bool,

    known_projectiles: HashSet<String>,
    tracks: Vec<ProjectileTrack>,
    last_outcome: Option<ShotOutcome>,

    session: ShooterSession,
    store: CalibrationStore,
    rng: StdRng,
}

impl ShooterAgent {
    /// シナリオ設定と既存の較正ストアからエージェントを構築
    pub fn new(scenario: &ScenarioConfig, store: CalibrationStore) -> Self {
        // 事前読み込みデータの目標角が十分広がっていれば粗い探索を省略
        let initial_step = match store.vertical_target_span() {
            Some(span) if span > BOOTSTRAP_SPAN_DEG => scenario.aim_policy.step_cap_deg,
            _ => 0.0,
        };
        let mut session = ShooterSession::new(initial_step);
        let regime = MotionRegime::from_config_str(&scenario.target_motion.regime);
        session.vertical_regime = regime;
        session.horizontal_regime = regime;

        Self {
            name: scenario.entities.shooter_name.clone(),
            target_name: scenario.entities.target_name.clone(),
            projectile_name: scenario.entities.projectile_name.clone(),
            policy: scenario.aim_policy.clone(),
            calibration: scenario.calibration.clone(),
            self_tracker: TransformTracker::new(scenario.entities.shooter_name.clone()),
            target_tracker: TransformTracker::new(scenario.entities.target_name.clone()),
            tick: 0,
            commands: CommandQueue::new(),
            engaged: true,
            phase: AimPhase::Aiming,
            aim_ticks: 0,
            on_target_ticks: 0,
            fire_hold_ticks: 0,
            desired: None,
            release_context: ReleaseContext::default(),
            aim_trace: Vec::new(),
            pending_shot: None,
            listening: false,
            known_projectiles: HashSet::new(),
            tracks: Vec::new(),
            last_outcome: None,
            session,
            store,
            rng: StdRng::seed_from_u64(scenario.sim.seed),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &ShooterSession {
        &self.session
    }

    pub fn store(&self) -> &CalibrationStore {
        &self.store
    }

    pub fn phase(&self) -> AimPhase {
        self.phase
    }

    /// 照準・発射ループの有効/無効を切り替える（発射シーケンスのトリガ）
    pub fn engage(&mut self, enabled: bool) {
        self.engaged = enabled;
    }

    /// 管理コマンドを将来ティックに予約
    pub fn schedule_command(&mut self, command: String, due_tick: u64) {
        self.commands.schedule(command, due_tick);
    }

    /// 1ティック分の処理を実行
    ///
    /// 観測の取り込み、予約コマンドの処理、照準状態機械の駆動、
    /// 新規発射体の特定、全トラックのステップと分析までを行います。
    /// 戻り値は発射チャージを開始したティックかどうかです。
    pub fn step(&mut self, snapshot: &ObservationSnapshot, sink: &mut dyn CommandSink) -> bool {
        self.self_tracker.update(snapshot);
        self.target_tracker.update(snapshot);
        self.commands.process(self.tick, sink);
        self.tick += 1;

        let mut charge_started = false;
        if self.engaged {
            charge_started = self.control_step(snapshot, sink);
        }

        self.bind_new_projectile(snapshot);
        self.step_tracks(snapshot);
        charge_started
    }

    /// 直近に完了したショットの報酬を取り出す
    pub fn record_outcome(&mut self) -> Option<f64> {
        self.last_outcome.take().map(|outcome| outcome.reward)
    }

    /// エピソード単位の状態をクリア（較正ストアと累計統計は保持）
    pub fn reset(&mut self) {
        self.tick = 0;
        self.commands.clear();
        self.self_tracker.clear();
        self.target_tracker.clear();
        self.phase = AimPhase::Aiming;
        self.aim_ticks = 0;
        self.on_target_ticks = 0;
        self.fire_hold_ticks = 0;
        self.desired = None;
        self.aim_trace.clear();
        self.pending_shot = None;
        self.listening = false;
        self.known_projectiles.clear();
        self.tracks.clear();
        self.last_outcome = None;
        self.session.reset_episode();
    }

    /// エージェントを分解して較正ストアを取り出す（永続化用）
    pub fn into_store(self) -> CalibrationStore {
        self.store
    }

    /// 照準状態機械の1ティック
    ///
    /// 自機またはターゲットの姿勢がこのティックの観測で更新されていない
    /// 場合は何もしません（コマンド発行も状態遷移もなし）。
    fn control_step(&mut self, snapshot: &ObservationSnapshot, sink: &mut dyn CommandSink) -> bool {
        let timestamp = snapshot.timestamp;
        let (Some(self_tf), Some(target_tf)) = (
            self.self_tracker.fresh(timestamp).cloned(),
            self.target_tracker.fresh(timestamp).cloned(),
        ) else {
            return false;
        };

        self.aim_trace.push(AimSample {
            yaw: math_utils::normalize_angle(self_tf.yaw),
            aim_pitch: -self_tf.pitch,
            timestamp,
        });

        let mut charge_started = false;
        match self.phase {
            AimPhase::Aiming => {
                if self.aim_ticks == 0 {
                    // 照準ループの先頭で一度だけ照準解を計算
                    let (solution, context) = solve_aim(
                        &self_tf,
                        &target_tf,
                        &self.store,
                        &self.calibration,
                        self.session.vert_step_deg,
                        &mut self.rng,
                    );
                    self.desired = Some(solution);
                    self.release_context = context;
                }
                self.aim_ticks += 1;
                self.rotation_step(&self_tf, sink);

                // 最低照準ティック数と整定デバウンスの両方を満たしたら発射へ
                if self.aim_ticks >= self.policy.min_aim_ticks
                    && self.on_target_ticks >= self.policy.settle_ticks
                {
                    self.phase = AimPhase::Shoot;
                    self.fire_hold_ticks = 0;
                    sink.set_fire(true);
                    charge_started = true;
                    debug!(
                        agent = %self.name,
                        aim_ticks = self.aim_ticks,
                        on_target_ticks = self.on_target_ticks,
                        desired_yaw = self.desired.map(|d| d.desired_yaw),
                        desired_pitch = self.desired.map(|d| d.desired_pitch),
                        "AIM_SETTLED: 照準が整定し発射チャージを開始しました"
                    );
                }
            }
            AimPhase::Shoot => {
                if self.fire_hold_ticks < self.policy.fire_hold_ticks {
                    self.fire_hold_ticks += 1;
                } else {
                    sink.set_fire(false);
                    let release = ShotRelease {
                        context: self.release_context,
                        desired_pitch: self.desired.map_or(0.0, |d| d.desired_pitch),
                        aim_trace: std::mem::take(&mut self.aim_trace),
                    };
                    self.pending_shot = Some(release);
                    self.listening = true;
                    self.session.vert_step_deg = (self.session.vert_step_deg
                        + self.policy.step_increment_deg)
                        .min(self.policy.step_cap_deg);
                    self.phase = AimPhase::Aiming;
                    self.aim_ticks = 0;
                    self.on_target_ticks = 0;
                    info!(
                        agent = %self.name,
                        vert_step_deg = self.session.vert_step_deg,
                        "SHOT_RELEASED: 発射をリリースし新規発射体の検出を待機します"
                    );
                }
            }
        }
        charge_started
    }

    /// 照準解へ向けた1ティック分の回転コマンドを発行
    ///
    /// コマンドの大きさは角度誤差に旋回速度係数を掛けたものです。
    /// 両軸の誤差が許容範囲内のティックが連続するたびに整定カウンタを進め、
    /// 外れたらリセットします。
    fn rotation_step(&mut self, self_tf: &Transform, sink: &mut dyn CommandSink) {
        let Some(desired) = self.desired else {
            return;
        };

        let yaw_diff = math_utils::angle_difference(self_tf.yaw, desired.desired_yaw);
        let pitch_diff = desired.desired_pitch - self_tf.pitch;
        let tolerance = self.policy.aim_tolerance_deg;

        if yaw_diff.abs() < tolerance {
            sink.turn(0.0);
        } else {
            sink.turn(yaw_diff * self.policy.turn_speed_multiplier);
        }

        if pitch_diff.abs() < tolerance {
            sink.pitch(0.0);
        } else {
            sink.pitch(pitch_diff * self.policy.turn_speed_multiplier);
        }

        if yaw_diff.abs() < tolerance && pitch_diff.abs() < tolerance {
            self.on_target_ticks += 1;
        } else {
            self.on_target_ticks = 0;
        }
    }

    /// 発射直後の新規発射体を観測から特定してトラックに束縛
    fn bind_new_projectile(&mut self, snapshot: &ObservationSnapshot) {
        if !self.listening || self.pending_shot.is_none() {
            return;
        }
        let Some(projectile) = snapshot.find_new_projectile(&self.projectile_name, &self.known_projectiles)
        else {
            return;
        };
        let Some(target) = snapshot.find_by_name(&self.target_name) else {
            return;
        };

        let projectile_id = projectile.id.clone();
        let target_id = target.id.clone();
        self.known_projectiles.insert(projectile_id.clone());
        if let Some(release) = self.pending_shot.take() {
            info!(
                agent = %self.name,
                projectile_id = %projectile_id,
                target_id = %target_id,
                "PROJECTILE_BOUND: 新規発射体をターゲットに束縛しました"
            );
            self.tracks.push(ProjectileTrack::new(
                projectile_id,
                target_id,
                self.policy.track_budget_ticks,
                release,
            ));
        }
        self.listening = false;
    }

    /// 全トラックをステップし、完了したものを分析して取り除く
    fn step_tracks(&mut self, snapshot: &ObservationSnapshot) {
        let mut i = 0;
        while i < self.tracks.len() {
            match self.tracks[i].step(snapshot) {
                TrackStatus::Tracking => {
                    i += 1;
                }
                TrackStatus::TargetLost => {
                    // 分析なしの破棄（学習に使えないショット）
                    self.tracks.remove(i);
                }
                TrackStatus::Completed => {
                    let track = self.tracks.remove(i);
                    match self.self_tracker.transform() {
                        Some(transform) => {
                            let outcome = analyze_trajectory(
                                &mut self.session,
                                &mut self.store,
                                &self.calibration,
                                transform.position,
                                &track,
                            );
                            if outcome.is_some() {
                                self.last_outcome = outcome;
                            }
                        }
                        None => {
                            warn!(
                                projectile_id = %track.projectile_id(),
                                "TRACK_DROPPED: 自機姿勢が未確定のため分析せず破棄しました"
                            );
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ObservedEntity;
    use crate::models::common::Vec3;
    use crate::scenario::ScenarioConfig;

    struct RecordingSink {
        turns: Vec<f64>,
        pitches: Vec<f64>,
        fire_events: Vec<bool>,
        chats: Vec<String>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                turns: Vec::new(),
                pitches: Vec::new(),
                fire_events: Vec::new(),
                chats: Vec::new(),
            }
        }
    }

    impl CommandSink for RecordingSink {
        fn turn(&mut self, rate: f64) {
            self.turns.push(rate);
        }
        fn pitch(&mut self, rate: f64) {
            self.pitches.push(rate);
        }
        fn set_fire(&mut self, charging: bool) {
            self.fire_events.push(charging);
        }
        fn chat(&mut self, command: &str) {
            self.chats.push(command.to_string());
        }
    }

    fn test_agent() -> ShooterAgent {
        let scenario = ScenarioConfig::default();
        ShooterAgent::new(&scenario, CalibrationStore::default())
    }

    fn snapshot(timestamp: f64, self_yaw: f64, self_pitch: f64, with_target: bool) -> ObservationSnapshot {
        let mut entities = vec![ObservedEntity {
            id: "archer_id".to_string(),
            name: "Archer".to_string(),
            position: Vec3::new(0.0, 4.0, 0.0),
            yaw: self_yaw,
            pitch: self_pitch,
        }];
        if with_target {
            entities.push(ObservedEntity {
                id: "mover_id".to_string(),
                name: "Mover".to_string(),
                position: Vec3::new(0.0, 4.0, 20.0),
                yaw: 180.0,
                pitch: 0.0,
            });
        }
        ObservationSnapshot { timestamp, entities }
    }

    #[test]
    fn test_no_commands_without_fresh_target() {
        let mut agent = test_agent();
        let mut sink = RecordingSink::new();
        // ターゲット不在の観測では状態機械は完全no-op
        agent.step(&snapshot(0.0, 0.0, 0.0, false), &mut sink);
        assert!(sink.turns.is_empty());
        assert!(sink.pitches.is_empty());
        assert!(sink.fire_events.is_empty());
        assert_eq!(agent.phase(), AimPhase::Aiming);
        assert_eq!(agent.aim_ticks, 0);
    }

    #[test]
    fn test_settle_debounce_two_ticks_does_not_transition() {
        let mut agent = test_agent();
        let mut sink = RecordingSink::new();

        // 照準解を固定し、最低照準ティック数は既に経過済みとする
        agent.desired = Some(AimSolution {
            desired_yaw: 0.0,
            desired_pitch: 0.0,
        });
        agent.aim_ticks = agent.policy.min_aim_ticks;

        // 許容範囲外→2ティックだけ範囲内
        let mut t = 0.0;
        agent.step(&snapshot(t, 50.0, 0.0, true), &mut sink);
        for _ in 0..2 {
            t += 0.05;
            agent.step(&snapshot(t, 0.0, 0.0, true), &mut sink);
        }
        assert_eq!(agent.on_target_ticks, 2);
        assert_eq!(agent.phase(), AimPhase::Aiming);
        assert!(sink.fire_events.is_empty());
    }

    #[test]
    fn test_settle_debounce_three_ticks_transitions() {
        let mut agent = test_agent();
        let mut sink = RecordingSink::new();

        agent.desired = Some(AimSolution {
            desired_yaw: 0.0,
            desired_pitch: 0.0,
        });
        agent.aim_ticks = agent.policy.min_aim_ticks;

        let mut t = 0.0;
        agent.step(&snapshot(t, 50.0, 0.0, true), &mut sink);
        for _ in 0..3 {
            t += 0.05;
            agent.step(&snapshot(t, 0.0, 0.0, true), &mut sink);
        }
        assert_eq!(agent.phase(), AimPhase::Shoot);
        assert_eq!(sink.fire_events, vec![true]);
    }

    #[test]
    fn test_fire_sequence_holds_then_releases() {
        let mut agent = test_agent();
        let mut sink = RecordingSink::new();

        agent.desired = Some(AimSolution {
            desired_yaw: 0.0,
            desired_pitch: 0.0,
        });
        agent.aim_ticks = agent.policy.min_aim_ticks;

        // 整定3ティックで発射チャージ開始
        let mut t = 0.0;
        for _ in 0..3 {
            agent.step(&snapshot(t, 0.0, 0.0, true), &mut sink);
            t += 0.05;
        }
        assert_eq!(agent.phase(), AimPhase::Shoot);
        let step_before = agent.session.vert_step_deg;

        // 2ティック保持後にリリース
        agent.step(&snapshot(t, 0.0, 0.0, true), &mut sink);
        t += 0.05;
        agent.step(&snapshot(t, 0.0, 0.0, true), &mut sink);
        t += 0.05;
        assert_eq!(agent.phase(), AimPhase::Shoot);
        agent.step(&snapshot(t, 0.0, 0.0, true), &mut sink);

        assert_eq!(agent.phase(), AimPhase::Aiming);
        assert_eq!(sink.fire_events, vec![true, false]);
        assert!(agent.listening);
        assert!(agent.pending_shot.is_some());
        // ショットごとにステップ角が増加（上限まで）
        assert_eq!(
            agent.session.vert_step_deg,
            (step_before + agent.policy.step_increment_deg).min(agent.policy.step_cap_deg)
        );
    }

    #[test]
    fn test_rotation_command_scaled_by_error() {
        let mut agent = test_agent();
        let mut sink = RecordingSink::new();

        agent.desired = Some(AimSolution {
            desired_yaw: 90.0,
            desired_pitch: -30.0,
        });
        agent.aim_ticks = 1;

        agent.step(&snapshot(0.0, 0.0, 0.0, true), &mut sink);

        let expected_turn = 90.0 * agent.policy.turn_speed_multiplier;
        let expected_pitch = -30.0 * agent.policy.turn_speed_multiplier;
        assert!((sink.turns[0] - expected_turn).abs() < 1e-12);
        assert!((sink.pitches[0] - expected_pitch).abs() < 1e-12);
    }

    #[test]
    fn test_projectile_binding_consumes_pending_shot() {
        let mut agent = test_agent();
        agent.listening = true;
        agent.pending_shot = Some(ShotRelease {
            context: ReleaseContext::default(),
            desired_pitch: -10.0,
            aim_trace: vec![AimSample {
                yaw: 0.0,
                aim_pitch: 10.0,
                timestamp: 0.0,
            }],
        });

        let mut snapshot = snapshot(0.05, 0.0, 0.0, true);
        snapshot.entities.push(ObservedEntity {
            id: "arrow9".to_string(),
            name: "Arrow".to_string(),
            position: Vec3::new(0.0, 5.0, 1.0),
            yaw: 0.0,
            pitch: 0.0,
        });

        agent.bind_new_projectile(&snapshot);

        assert!(!agent.listening);
        assert!(agent.pending_shot.is_none());
        assert_eq!(agent.tracks.len(), 1);
        assert!(agent.known_projectiles.contains("arrow9"));
    }

    #[test]
    fn test_reset_preserves_store_and_totals() {
        let mut agent = test_agent();
        agent.store.vertical_static.append(&[10.0, 1.0], 12.0);
        agent.session.total_shots = 5;
        agent.session.episode_shots = 2;
        agent.listening = true;
        agent.known_projectiles.insert("a1".to_string());

        agent.reset();

        assert_eq!(agent.store.vertical_static.len(), 1);
        assert_eq!(agent.session.total_shots, 5);
        assert_eq!(agent.session.episode_shots, 0);
        assert!(!agent.listening);
        assert!(agent.known_projectiles.is_empty());
        assert_eq!(agent.phase(), AimPhase::Aiming);
    }

    #[test]
    fn test_scheduled_commands_fire_at_due_tick() {
        let mut agent = test_agent();
        let mut sink = RecordingSink::new();
        agent.schedule_command("/cleanup".to_string(), 2);

        agent.step(&snapshot(0.0, 0.0, 0.0, false), &mut sink);
        agent.step(&snapshot(0.05, 0.0, 0.0, false), &mut sink);
        assert!(sink.chats.is_empty());
        agent.step(&snapshot(0.1, 0.0, 0.0, false), &mut sink);
        assert_eq!(sink.chats, vec!["/cleanup".to_string()]);
    }
}
