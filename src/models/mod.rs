// 基本的なデータ型と数学ユーティリティ
pub mod common;

// 観測からの姿勢追跡
pub mod transform;

// 較正ストアとモデル
pub mod calibration;

// 照準ソルバ
pub mod aim;

// 射撃エージェント（照準状態機械）
pub mod shooter;

// 発射体トラッカー
pub mod projectile;

// 結果分類器
pub mod outcome;

// 便利な re-export
pub use aim::{solve_aim, AimSolution, ReleaseContext};
pub use calibration::{CalibrationStore, CalibrationTable, CommitMarker};
pub use common::{math_utils, Vec3};
pub use outcome::{analyze_trajectory, ShotOutcome};
pub use projectile::{AimSample, ProjectileTrack, ShotRelease, TrackStatus};
pub use shooter::{AimPhase, MotionRegime, ShooterAgent, ShooterSession};
pub use transform::{Transform, TransformTracker};
