//! # Simulation モジュール
//!
//! 射撃エージェントのエピソード駆動エンジンを提供します。
//!
//! このモジュールは、観測スナップショットの取得からエージェントの
//! ティック処理、ショット結果の集計までを1エピソード単位で管理します。
//! 観測はホストを短い間隔でポーリングして取得し、固定の待機予算を
//! 超過した場合はエピソード失敗として上位へ報告します。
//!
//! ## ティックごとの処理順序
//!
//! 1. **観測取得**: ホストへのポーリング（予算付き）
//! 2. **エージェント処理**: 姿勢更新、予約コマンド、照準状態機械
//! 3. **結果回収**: 完了したショットの報酬の取り出し
//!
//! 較正ストアはエピソードをまたいで保持され、シナリオに永続化パスが
//! 設定されている場合は実行終了時に保存されます。

use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::host::{
    CommandSink, HostError, HostPoll, ObservationSnapshot, ObservationSource, ObservedEntity,
    SimulationHost,
};
use crate::models::calibration::CalibrationStore;
use crate::models::common::{math_utils, Vec3};
use crate::models::shooter::ShooterAgent;
use crate::scenario::ScenarioConfig;

/// 1エピソードの実行結果
#[derive(Debug, Clone)]
pub struct EpisodeReport {
    pub episode: u32,
    pub ticks: u64,
    pub shots: u64,
    pub hits: u64,
    /// 回収できたショット報酬（2次元ミスベクトル長の負値）
    pub rewards: Vec<f64>,
}

/// エピソード実行エラー
#[derive(Debug)]
pub enum EpisodeError {
    /// 待機予算内に有効な観測が届かなかった（エピソード失敗）
    ObservationTimeout { waited_s: f64 },
    /// ホスト側エラー
    Host(HostError),
}

impl std::fmt::Display for EpisodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EpisodeError::ObservationTimeout { waited_s } => {
                write!(f, "観測タイムアウト: {:.1}秒以内に観測が届きませんでした", waited_s)
            }
            EpisodeError::Host(err) => write!(f, "ホストエラー: {}", err),
        }
    }
}

impl std::error::Error for EpisodeError {}

impl From<HostError> for EpisodeError {
    fn from(err: HostError) -> Self {
        EpisodeError::Host(err)
    }
}

/// エピソード駆動エンジン
pub struct EpisodeEngine {
    pub scenario: ScenarioConfig,
    pub shooter: ShooterAgent,
    pub verbose_level: u8,
    pub episodes_completed: u32,
}

impl EpisodeEngine {
    /// シナリオからエンジンを構築
    ///
    /// 永続化パスが設定されていて既存ファイルがある場合は較正ストアを
    /// 読み込み、無ければ空のストアから開始します。
    pub fn new(scenario: ScenarioConfig, verbose_level: u8) -> Result<Self, Box<dyn std::error::Error>> {
        let store = match &scenario.calibration.dataset_path {
            Some(path) if std::path::Path::new(path).exists() => {
                let store = CalibrationStore::from_file(path)?;
                info!(
                    dataset_path = %path,
                    total_samples = store.total_len(),
                    "DATASET_LOADED: 較正データを読み込みました"
                );
                store
            }
            _ => CalibrationStore::default(),
        };

        let shooter = ShooterAgent::new(&scenario, store);
        Ok(Self {
            scenario,
            shooter,
            verbose_level,
            episodes_completed: 0,
        })
    }

    /// 設定された全エピソードを実行し、終了時に較正ストアを保存
    pub fn run<H: SimulationHost + EpisodeHost>(
        &mut self,
        host: &mut H,
    ) -> Result<Vec<EpisodeReport>, Box<dyn std::error::Error>> {
        info!("=== シミュレーション実行開始 ===");
        let mut reports = Vec::new();

        for episode in 0..self.scenario.sim.episodes {
            host.start_episode(episode);
            let report = self.run_episode(host, episode)?;
            info!(
                episode = report.episode,
                ticks = report.ticks,
                shots = report.shots,
                hits = report.hits,
                "EPISODE_FINISHED: エピソードが終了しました"
            );
            reports.push(report);
            self.episodes_completed += 1;
        }

        info!("=== シミュレーション完了 ===");
        let session = self.shooter.session();
        let mean_vertical_error = session.vertical_errors.iter().sum::<f64>()
            / session.vertical_errors.len().max(1) as f64;
        let mean_horizontal_error = session.horizontal_errors.iter().sum::<f64>()
            / session.horizontal_errors.len().max(1) as f64;
        info!(
            total_shots = session.total_shots,
            total_hits = session.total_hits,
            mean_vertical_error = mean_vertical_error,
            mean_horizontal_error = mean_horizontal_error,
            calibration_samples = self.shooter.store().total_len(),
            "SIMULATION_SUMMARY: 実行サマリ"
        );

        if let Some(path) = &self.scenario.calibration.dataset_path {
            self.shooter.store().save_to_file(path)?;
            info!(dataset_path = %path, "DATASET_SAVED: 較正データを保存しました");
        }

        Ok(reports)
    }

    /// 1エピソードを実行
    pub fn run_episode<H: SimulationHost>(
        &mut self,
        host: &mut H,
        episode: u32,
    ) -> Result<EpisodeReport, EpisodeError> {
        self.shooter.reset();
        for admin in &self.scenario.admin_commands {
            self.shooter.schedule_command(admin.command.clone(), admin.due_tick);
        }

        let shots_before = self.shooter.session().total_shots;
        let hits_before = self.shooter.session().total_hits;
        let mut rewards = Vec::new();
        let mut ticks = 0u64;

        while ticks < self.scenario.sim.max_ticks {
            let Some(snapshot) = self.acquire_snapshot(host)? else {
                // ホスト側でミッションが終了した
                break;
            };

            self.shooter.step(&snapshot, host);
            if let Some(reward) = self.shooter.record_outcome() {
                debug!(
                    episode = episode,
                    reward = reward,
                    "SHOT_REWARD: ショット報酬を回収しました"
                );
                rewards.push(reward);
            }

            ticks += 1;
            if self.verbose_level > 1 && ticks % 200 == 0 {
                debug!(
                    episode = episode,
                    ticks = ticks,
                    shots = self.shooter.session().episode_shots,
                    "EPISODE_PROGRESS: エピソード進行中"
                );
            }
        }

        Ok(EpisodeReport {
            episode,
            ticks,
            shots: self.shooter.session().total_shots - shots_before,
            hits: self.shooter.session().total_hits - hits_before,
            rewards,
        })
    }

    /// 観測スナップショットを予算付きポーリングで取得
    ///
    /// ホストがPendingを返す間は短い間隔で再試行し、待機予算を超えたら
    /// タイムアウトエラーを返します。ミッション終了はNoneです。
    fn acquire_snapshot<H: ObservationSource>(
        &self,
        host: &mut H,
    ) -> Result<Option<ObservationSnapshot>, EpisodeError> {
        let poll_interval = self.scenario.sim.observation_poll_s;
        let budget = self.scenario.sim.observation_timeout_s;
        let mut waited = 0.0;

        loop {
            match host.poll()? {
                HostPoll::Snapshot(snapshot) => return Ok(Some(snapshot)),
                HostPoll::MissionEnded => return Ok(None),
                HostPoll::Pending => {
                    if waited >= budget {
                        warn!(
                            waited_s = waited,
                            "OBSERVATION_TIMEOUT: 観測待機予算を超過しました"
                        );
                        return Err(EpisodeError::ObservationTimeout { waited_s: waited });
                    }
                    thread::sleep(Duration::from_secs_f64(poll_interval));
                    waited += poll_interval;
                }
            }
        }
    }
}

/// エピソード境界の通知を受け取るホスト
pub trait EpisodeHost {
    /// 新しいエピソードの開始（ターゲット再配置など）
    fn start_episode(&mut self, episode: u32);
}

/// 組み込みの合成射撃場ホスト
///
/// テストモードと統合テスト用の決定的なインプロセスホストです。
/// 回転コマンドを最大旋回速度でスケールして自機姿勢に適用し、
/// リリース時に照準方向へ発射体を生成して単純な運動学で飛ばします。
/// 物理エンジンではなく、制御ループを駆動するための試験設備です。
pub struct SyntheticRange {
    scenario: ScenarioConfig,
    rng: StdRng,
    tick: u64,
    mission_ticks: u64,

    shooter_position: Vec3,
    shooter_yaw: f64,
    shooter_pitch: f64,
    turn_rate: f64,
    pitch_rate: f64,

    target_position: Vec3,
    target_direction: f64,

    charging: bool,
    projectiles: Vec<SyntheticProjectile>,
    spawned_projectiles: u64,

    /// ホストが受理したチャットコマンドの記録
    pub chat_log: Vec<String>,
}

struct SyntheticProjectile {
    id: String,
    position: Vec3,
    velocity: Vec3,
    age_ticks: u64,
}

/// 合成ホストの最大旋回速度（度/秒）
const SYNTHETIC_TURN_SPEED_DEGS: f64 = 900.0;

/// 合成ホストの発射体初速（m/s）
const SYNTHETIC_PROJECTILE_SPEED: f64 = 30.0;

/// 合成ホストの重力加速度（m/s²）
const SYNTHETIC_GRAVITY: f64 = 9.8;

impl SyntheticRange {
    pub fn new(scenario: ScenarioConfig, mission_ticks: u64) -> Self {
        let seed = scenario.sim.seed;
        let spawn_y = scenario.target_motion.spawn_y_m;
        Self {
            scenario,
            rng: StdRng::seed_from_u64(seed),
            tick: 0,
            mission_ticks,
            shooter_position: Vec3::new(0.0, 4.0, 0.0),
            shooter_yaw: 0.0,
            shooter_pitch: 0.0,
            turn_rate: 0.0,
            pitch_rate: 0.0,
            target_position: Vec3::new(0.0, spawn_y, 20.0),
            target_direction: 1.0,
            charging: false,
            projectiles: Vec::new(),
            spawned_projectiles: 0,
            chat_log: Vec::new(),
        }
    }

    /// 1ティック分の世界更新
    fn advance(&mut self) {
        let dt = self.scenario.sim.tick_s;

        // 回転コマンドの適用
        self.shooter_yaw = math_utils::normalize_angle(
            self.shooter_yaw + self.turn_rate * SYNTHETIC_TURN_SPEED_DEGS * dt,
        );
        self.shooter_pitch =
            (self.shooter_pitch + self.pitch_rate * SYNTHETIC_TURN_SPEED_DEGS * dt).clamp(-90.0, 90.0);

        // ターゲットの往復移動（movingのみ）
        if self.scenario.target_motion.regime == "moving" {
            let speed = self.scenario.target_motion.speed_mps;
            self.target_position.x += self.target_direction * speed * dt;
            if self.target_position.x.abs() > self.scenario.target_motion.spawn_x_range[1].abs() {
                self.target_direction = -self.target_direction;
            }
        }

        // 発射体の運動更新
        for projectile in &mut self.projectiles {
            projectile.position = projectile.position + projectile.velocity * dt;
            projectile.velocity.y -= SYNTHETIC_GRAVITY * dt;
            projectile.age_ticks += 1;
        }
        self.projectiles
            .retain(|p| p.position.y > 0.0 && p.age_ticks < 200);

        self.tick += 1;
    }

    fn build_snapshot(&self) -> ObservationSnapshot {
        let mut entities = vec![
            ObservedEntity {
                id: "shooter_1".to_string(),
                name: self.scenario.entities.shooter_name.clone(),
                position: self.shooter_position,
                yaw: self.shooter_yaw,
                pitch: self.shooter_pitch,
            },
            ObservedEntity {
                id: "target_1".to_string(),
                name: self.scenario.entities.target_name.clone(),
                position: self.target_position,
                yaw: 180.0,
                pitch: 0.0,
            },
        ];
        for projectile in &self.projectiles {
            entities.push(ObservedEntity {
                id: projectile.id.clone(),
                name: self.scenario.entities.projectile_name.clone(),
                position: projectile.position,
                yaw: 0.0,
                pitch: 0.0,
            });
        }
        ObservationSnapshot {
            timestamp: self.tick as f64 * self.scenario.sim.tick_s,
            entities,
        }
    }

    /// 照準方向への発射体生成
    fn spawn_projectile(&mut self) {
        self.spawned_projectiles += 1;
        let yaw_rad = math_utils::deg_to_rad(self.shooter_yaw);
        let pitch_rad = math_utils::deg_to_rad(self.shooter_pitch);
        // ピッチは下向き正のホスト規約
        let direction = Vec3::new(
            -yaw_rad.sin() * pitch_rad.cos(),
            -pitch_rad.sin(),
            yaw_rad.cos() * pitch_rad.cos(),
        );
        self.projectiles.push(SyntheticProjectile {
            id: format!("projectile_{}", self.spawned_projectiles),
            position: self.shooter_position + Vec3::new(0.0, 1.6, 0.0) + direction,
            velocity: direction * SYNTHETIC_PROJECTILE_SPEED,
            age_ticks: 0,
        });
    }
}

impl ObservationSource for SyntheticRange {
    fn poll(&mut self) -> Result<HostPoll, HostError> {
        if self.tick >= self.mission_ticks {
            return Ok(HostPoll::MissionEnded);
        }
        self.advance();
        Ok(HostPoll::Snapshot(self.build_snapshot()))
    }
}

impl CommandSink for SyntheticRange {
    fn turn(&mut self, rate: f64) {
        self.turn_rate = rate.clamp(-1.0, 1.0);
    }

    fn pitch(&mut self, rate: f64) {
        self.pitch_rate = rate.clamp(-1.0, 1.0);
    }

    fn set_fire(&mut self, charging: bool) {
        if self.charging && !charging {
            self.spawn_projectile();
        }
        self.charging = charging;
    }

    fn chat(&mut self, command: &str) {
        self.chat_log.push(command.to_string());
    }
}

impl EpisodeHost for SyntheticRange {
    fn start_episode(&mut self, _episode: u32) {
        let motion = &self.scenario.target_motion;
        let x = self.rng.gen_range(motion.spawn_x_range[0]..=motion.spawn_x_range[1]);
        let z = self.rng.gen_range(motion.spawn_z_range[0]..=motion.spawn_z_range[1]);
        self.target_position = Vec3::new(x, motion.spawn_y_m, z);
        self.target_direction = 1.0;
        self.projectiles.clear();
        self.charging = false;
        self.turn_rate = 0.0;
        self.pitch_rate = 0.0;
    }
}
