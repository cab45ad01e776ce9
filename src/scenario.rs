use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// シナリオメタデータ
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScenarioMeta {
    pub version: String,
    pub name: String,
    pub description: String,
}

/// シミュレーション設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// 1ティックの長さ（秒）
    pub tick_s: f64,
    /// 1エピソードの最大ティック数
    pub max_ticks: u64,
    /// 実行するエピソード数
    pub episodes: u32,
    pub seed: u64,
    /// 観測のサブポーリング間隔（秒）
    #[serde(default = "default_observation_poll_s")]
    pub observation_poll_s: f64,
    /// 観測取得の待機予算（秒）。超過でエピソード失敗
    #[serde(default = "default_observation_timeout_s")]
    pub observation_timeout_s: f64,
}

fn default_observation_poll_s() -> f64 {
    0.05
}

fn default_observation_timeout_s() -> f64 {
    10.0
}

/// エンティティ名設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EntitiesConfig {
    pub shooter_name: String,
    pub target_name: String,
    /// 追跡対象とする発射体の種別名
    pub projectile_name: String,
}

/// 照準ポリシー設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AimPolicyConfig {
    /// 発射前に最低限費やす照準ティック数
    #[serde(default = "default_min_aim_ticks")]
    pub min_aim_ticks: u32,
    /// 整定とみなす連続オンターゲットティック数（デバウンス）
    #[serde(default = "default_settle_ticks")]
    pub settle_ticks: u32,
    /// オンターゲット判定の角度許容値（度）
    #[serde(default = "default_aim_tolerance_deg")]
    pub aim_tolerance_deg: f64,
    /// 角度誤差を回転コマンドへ変換する係数
    #[serde(default = "default_turn_speed_multiplier")]
    pub turn_speed_multiplier: f64,
    /// チャージ開始からリリースまでの保持ティック数
    #[serde(default = "default_fire_hold_ticks")]
    pub fire_hold_ticks: u32,
    /// ショットごとの段階探索ステップ角の増分（度）
    #[serde(default = "default_step_increment_deg")]
    pub step_increment_deg: f64,
    /// 段階探索ステップ角の上限（度）
    #[serde(default = "default_step_cap_deg")]
    pub step_cap_deg: f64,
    /// 発射体トラックのティック予算
    #[serde(default = "default_track_budget_ticks")]
    pub track_budget_ticks: u32,
}

fn default_min_aim_ticks() -> u32 {
    20
}

fn default_settle_ticks() -> u32 {
    3
}

fn default_aim_tolerance_deg() -> f64 {
    2.0
}

fn default_turn_speed_multiplier() -> f64 {
    2.0 / 360.0
}

fn default_fire_hold_ticks() -> u32 {
    2
}

fn default_step_increment_deg() -> f64 {
    3.0
}

fn default_step_cap_deg() -> f64 {
    45.0
}

fn default_track_budget_ticks() -> u32 {
    50
}

impl Default for AimPolicyConfig {
    fn default() -> Self {
        Self {
            min_aim_ticks: default_min_aim_ticks(),
            settle_ticks: default_settle_ticks(),
            aim_tolerance_deg: default_aim_tolerance_deg(),
            turn_speed_multiplier: default_turn_speed_multiplier(),
            fire_hold_ticks: default_fire_hold_ticks(),
            step_increment_deg: default_step_increment_deg(),
            step_cap_deg: default_step_cap_deg(),
            track_budget_ticks: default_track_budget_ticks(),
        }
    }
}

/// 較正モデル設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CalibrationConfig {
    /// 垂直静的テーブルのフィット閾値（この件数を超えたら回帰）
    #[serde(default = "default_vertical_fit_threshold")]
    pub vertical_fit_threshold: usize,
    /// 水平静的テーブルのフィット閾値
    #[serde(default = "default_horizontal_fit_threshold")]
    pub horizontal_fit_threshold: usize,
    /// 先行補正テーブルのフィット閾値
    #[serde(default = "default_leading_fit_threshold")]
    pub leading_fit_threshold: usize,
    /// 垂直静的テーブルを急角/浅角に分割する目標角（度）
    #[serde(default = "default_steep_split_deg")]
    pub steep_split_deg: f64,
    /// ピッチ予測の上限（度）
    #[serde(default = "default_max_pitch_deg")]
    pub max_pitch_deg: f64,
    /// 較正ストアの永続化ファイル（外部コラボレータが読み書き）
    #[serde(default)]
    pub dataset_path: Option<String>,
}

fn default_vertical_fit_threshold() -> usize {
    100
}

fn default_horizontal_fit_threshold() -> usize {
    1000
}

fn default_leading_fit_threshold() -> usize {
    100
}

fn default_steep_split_deg() -> f64 {
    45.0
}

fn default_max_pitch_deg() -> f64 {
    89.9
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            vertical_fit_threshold: default_vertical_fit_threshold(),
            horizontal_fit_threshold: default_horizontal_fit_threshold(),
            leading_fit_threshold: default_leading_fit_threshold(),
            steep_split_deg: default_steep_split_deg(),
            max_pitch_deg: default_max_pitch_deg(),
            dataset_path: None,
        }
    }
}

/// ターゲット配置・運動設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetMotionConfig {
    /// モーション領域: "static" または "moving"
    pub regime: String,
    /// エピソードごとのX座標配置範囲（m）
    pub spawn_x_range: [f64; 2],
    /// エピソードごとのZ座標配置範囲（m）
    pub spawn_z_range: [f64; 2],
    /// 配置高度（m）
    pub spawn_y_m: f64,
    /// 移動ターゲットの速度（m/s、movingのみ）
    #[serde(default)]
    pub speed_mps: f64,
}

/// 将来ティックに予約する管理コマンド
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminCommandConfig {
    pub command: String,
    pub due_tick: u64,
}

/// 完全なシナリオ設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScenarioConfig {
    pub meta: ScenarioMeta,
    pub sim: SimulationConfig,
    pub entities: EntitiesConfig,
    #[serde(default)]
    pub aim_policy: AimPolicyConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    pub target_motion: TargetMotionConfig,
    #[serde(default)]
    pub admin_commands: Vec<AdminCommandConfig>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            meta: ScenarioMeta {
                version: "1.0".to_string(),
                name: "default".to_string(),
                description: "静止ターゲットに対する基本射撃".to_string(),
            },
            sim: SimulationConfig {
                tick_s: 0.05,
                max_ticks: 2000,
                episodes: 1,
                seed: 7,
                observation_poll_s: default_observation_poll_s(),
                observation_timeout_s: default_observation_timeout_s(),
            },
            entities: EntitiesConfig {
                shooter_name: "Archer".to_string(),
                target_name: "Mover".to_string(),
                projectile_name: "Arrow".to_string(),
            },
            aim_policy: AimPolicyConfig::default(),
            calibration: CalibrationConfig::default(),
            target_motion: TargetMotionConfig {
                regime: "static".to_string(),
                spawn_x_range: [-20.0, 20.0],
                spawn_z_range: [10.0, 30.0],
                spawn_y_m: 4.0,
                speed_mps: 0.0,
            },
            admin_commands: Vec::new(),
        }
    }
}

impl ScenarioConfig {
    /// YAMLファイルからシナリオ設定を読み込み
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ScenarioError> {
        let path = path.as_ref();

        // ファイル存在チェック
        if !path.exists() {
            return Err(ScenarioError::FileNotFound(path.to_path_buf()));
        }

        // ファイル読み込み
        let contents = fs::read_to_string(path)
            .map_err(|e| ScenarioError::IoError(path.to_path_buf(), e))?;

        // YAML解析
        let config: ScenarioConfig = serde_yaml::from_str(&contents)
            .map_err(|e| ScenarioError::ParseError(path.to_path_buf(), e))?;

        // 基本的な検証
        config.validate()?;

        Ok(config)
    }

    /// 設定の基本的な検証
    pub fn validate(&self) -> Result<(), ScenarioError> {
        // 時間設定の検証
        if self.sim.tick_s <= 0.0 {
            return Err(ScenarioError::ValidationError("tick_s must be positive".to_string()));
        }
        if self.sim.max_ticks == 0 {
            return Err(ScenarioError::ValidationError("max_ticks must be positive".to_string()));
        }
        if self.sim.episodes == 0 {
            return Err(ScenarioError::ValidationError("episodes must be positive".to_string()));
        }
        if self.sim.observation_poll_s <= 0.0
            || self.sim.observation_timeout_s <= self.sim.observation_poll_s
        {
            return Err(ScenarioError::ValidationError(
                "observation_timeout_s must exceed observation_poll_s".to_string(),
            ));
        }

        // 照準ポリシーの検証
        if self.aim_policy.min_aim_ticks == 0 || self.aim_policy.settle_ticks == 0 {
            return Err(ScenarioError::ValidationError(
                "min_aim_ticks and settle_ticks must be positive".to_string(),
            ));
        }
        if self.aim_policy.aim_tolerance_deg <= 0.0 {
            return Err(ScenarioError::ValidationError(
                "aim_tolerance_deg must be positive".to_string(),
            ));
        }
        if self.aim_policy.track_budget_ticks == 0 {
            return Err(ScenarioError::ValidationError(
                "track_budget_ticks must be positive".to_string(),
            ));
        }

        // エンティティ名の検証
        if self.entities.shooter_name.is_empty()
            || self.entities.target_name.is_empty()
            || self.entities.projectile_name.is_empty()
        {
            return Err(ScenarioError::ValidationError(
                "entity names must not be empty".to_string(),
            ));
        }

        // 配置範囲の検証
        let motion = &self.target_motion;
        if motion.spawn_x_range[0] > motion.spawn_x_range[1]
            || motion.spawn_z_range[0] > motion.spawn_z_range[1]
        {
            return Err(ScenarioError::ValidationError(
                "invalid spawn range bounds".to_string(),
            ));
        }
        match motion.regime.as_str() {
            "static" | "moving" => {}
            other => {
                return Err(ScenarioError::ValidationError(format!(
                    "unknown target motion regime: {}",
                    other
                )));
            }
        }

        Ok(())
    }

    /// シナリオの概要を表示
    pub fn print_summary(&self) {
        println!("=== シナリオ情報 ===");
        println!("名前: {}", self.meta.name);
        println!("説明: {}", self.meta.description);
        println!("バージョン: {}", self.meta.version);
        println!();

        println!("=== シミュレーション設定 ===");
        println!("時間刻み: {:.3}秒", self.sim.tick_s);
        println!("最大ティック数: {}", self.sim.max_ticks);
        println!("エピソード数: {}", self.sim.episodes);
        println!("シード値: {}", self.sim.seed);
        println!();

        println!("=== エージェント設定 ===");
        println!("射手: {}", self.entities.shooter_name);
        println!("ターゲット: {} ({})", self.entities.target_name, self.target_motion.regime);
        println!("発射体: {}", self.entities.projectile_name);
        println!(
            "照準: 最低{}ティック / 整定{}ティック / 許容{:.1}度",
            self.aim_policy.min_aim_ticks,
            self.aim_policy.settle_ticks,
            self.aim_policy.aim_tolerance_deg
        );
        if let Some(path) = &self.calibration.dataset_path {
            println!("較正データ: {}", path);
        }
    }
}

/// シナリオ読み込みエラー
#[derive(Debug)]
pub enum ScenarioError {
    FileNotFound(std::path::PathBuf),
    IoError(std::path::PathBuf, std::io::Error),
    ParseError(std::path::PathBuf, serde_yaml::Error),
    ValidationError(String),
}

impl std::fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioError::FileNotFound(path) => {
                write!(f, "シナリオファイルが見つかりません: {}", path.display())
            }
            ScenarioError::IoError(path, err) => {
                write!(f, "ファイル読み込みエラー {}: {}", path.display(), err)
            }
            ScenarioError::ParseError(path, err) => {
                write!(f, "YAML解析エラー {}: {}", path.display(), err)
            }
            ScenarioError::ValidationError(msg) => {
                write!(f, "設定検証エラー: {}", msg)
            }
        }
    }
}

impl std::error::Error for ScenarioError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = ScenarioConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_policy_defaults_match_documented_constants() {
        let policy = AimPolicyConfig::default();
        assert_eq!(policy.min_aim_ticks, 20);
        assert_eq!(policy.settle_ticks, 3);
        assert_eq!(policy.fire_hold_ticks, 2);
        assert_eq!(policy.track_budget_ticks, 50);
        assert!((policy.turn_speed_multiplier - 2.0 / 360.0).abs() < 1e-12);

        let calibration = CalibrationConfig::default();
        assert_eq!(calibration.vertical_fit_threshold, 100);
        assert_eq!(calibration.horizontal_fit_threshold, 1000);
        assert_eq!(calibration.leading_fit_threshold, 100);
        assert_eq!(calibration.max_pitch_deg, 89.9);
    }

    #[test]
    fn test_invalid_regime_rejected() {
        let mut config = ScenarioConfig::default();
        config.target_motion.regime = "orbiting".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r#"
meta:
  version: "1.0"
  name: "minimal"
  description: "最小構成"
sim:
  tick_s: 0.05
  max_ticks: 1000
  episodes: 2
  seed: 11
entities:
  shooter_name: "Archer"
  target_name: "Mover"
  projectile_name: "Arrow"
target_motion:
  regime: "moving"
  spawn_x_range: [-10.0, 10.0]
  spawn_z_range: [15.0, 25.0]
  spawn_y_m: 4.0
  speed_mps: 2.0
"#;
        let config: ScenarioConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.aim_policy.min_aim_ticks, 20);
        assert_eq!(config.calibration.horizontal_fit_threshold, 1000);
        assert_eq!(config.target_motion.regime, "moving");
    }
}
