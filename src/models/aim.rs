use rand::Rng;
use tracing::debug;

use crate::models::calibration::CalibrationStore;
use crate::models::common::{math_utils, Vec3};
use crate::models::transform::Transform;
use crate::scenario::CalibrationConfig;

/// 照準計算の出力
#[derive(Debug, Clone, Copy)]
pub struct AimSolution {
    /// 目標ヨー角（度、正規化済み）
    pub desired_yaw: f64,
    /// 目標ピッチ角（度、ホスト規約の下向き正）
    pub desired_pitch: f64,
}

/// 発射時コンテキスト
///
/// 照準計算時点のターゲット速度分解と自機ヨーのスナップショット。
/// 結果分類器が「逸らされなかった場合」の位置を逆外挿するために使用します。
#[derive(Debug, Clone, Copy, Default)]
pub struct ReleaseContext {
    /// 視線直交方向の速度成分（m/s、符号付き）
    pub lateral_velocity: f64,
    /// 鉛直方向の速度成分（m/s、符号付き）
    pub vertical_velocity: f64,
    /// 視線方向の速度成分（m/s、符号付き）
    pub forward_velocity: f64,
    /// 照準計算時点の自機ヨー（度、正規化済み）
    pub release_yaw: f64,
}

/// 自機とターゲットの姿勢から目標照準角を解く
///
/// 水平距離・高度差・方位角差を計算し、ターゲット速度を視線基準の
/// 3方向（横・鉛直・前後）へ符号付きで分解したうえで、静的モデルと
/// 先行補正モデルの合算をピッチ/ヨーそれぞれの補正角とします。
///
/// # 引数
///
/// * `self_transform` - 自機の姿勢
/// * `target_transform` - ターゲットの姿勢（速度未確定の場合は静止扱い）
/// * `store` - 較正ストア
/// * `config` - 較正モデル設定
/// * `fallback_step_deg` - 垂直静的モデルの段階探索ステップ角
/// * `rng` - 水平静的モデルのランダム探索に使用する乱数生成器
///
/// # 戻り値
///
/// 照準解と、結果分類器が後で使用する発射時コンテキスト
pub fn solve_aim<R: Rng>(
    self_transform: &Transform,
    target_transform: &Transform,
    store: &CalibrationStore,
    config: &CalibrationConfig,
    fallback_step_deg: f64,
    rng: &mut R,
) -> (AimSolution, ReleaseContext) {
    let self_pos = self_transform.position;
    let target_pos = target_transform.position;

    let distance = self_pos.flat_distance(&target_pos);
    let elevation = target_pos.y - self_pos.y;

    let bearing = math_utils::normalize_angle(math_utils::bearing_deg(
        self_pos.x, self_pos.z, target_pos.x, target_pos.z,
    ));
    let bearing_delta = math_utils::normalize_angle(bearing - self_transform.yaw);

    // ターゲット速度を視線基準の3方向へ分解
    let velocity = target_transform.velocity_or_zero();
    let lateral_axis = math_utils::vector_from_yaw(math_utils::normalize_angle(bearing + 270.0));
    let forward_axis = math_utils::vector_from_yaw(bearing);
    let vertical_axis = Vec3::new(0.0, 1.0, 0.0);

    let lateral_velocity = math_utils::signed_projection(&velocity, &lateral_axis);
    let vertical_velocity = math_utils::signed_projection(&velocity, &vertical_axis);
    let forward_velocity = math_utils::signed_projection(&velocity, &forward_axis);

    // 垂直補正 = 静的モデル + 先行補正モデル（目線高さ分の+1を加味）
    let delta_pitch = store.pitch_to_target(config, distance, elevation + 1.0, fallback_step_deg)
        + store.leading_pitch(config, distance, elevation + 1.0, vertical_velocity);

    // 水平補正 = 静的モデル + 先行補正モデル
    let delta_yaw = store.yaw_to_target(config, bearing_delta, rng)
        + store.leading_yaw(config, distance, lateral_velocity, forward_velocity);

    let solution = AimSolution {
        desired_yaw: math_utils::normalize_angle(self_transform.yaw + delta_yaw),
        desired_pitch: -delta_pitch,
    };
    let context = ReleaseContext {
        lateral_velocity,
        vertical_velocity,
        forward_velocity,
        release_yaw: math_utils::normalize_angle(self_transform.yaw),
    };

    debug!(
        distance = distance,
        elevation = elevation,
        bearing_delta = bearing_delta,
        lateral_velocity = lateral_velocity,
        vertical_velocity = vertical_velocity,
        forward_velocity = forward_velocity,
        desired_yaw = solution.desired_yaw,
        desired_pitch = solution.desired_pitch,
        "AIM_SOLVED: 照準解を計算しました"
    );

    (solution, context)
}

/// 発射時コンテキストからターゲットの推定速度ベクトルを再構成
///
/// 分解時と同じ基底（release_yawの横・前後方向と鉛直方向）を用いて
/// 3成分を合成します。
pub fn reconstruct_velocity(context: &ReleaseContext) -> Vec3 {
    let lateral_axis =
        math_utils::vector_from_yaw(math_utils::normalize_angle(context.release_yaw + 270.0));
    let forward_axis = math_utils::vector_from_yaw(context.release_yaw);
    lateral_axis * context.lateral_velocity
        + forward_axis * context.forward_velocity
        + Vec3::new(0.0, 1.0, 0.0) * context.vertical_velocity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ObservationSnapshot, ObservedEntity};
    use crate::models::transform::TransformTracker;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn transform_at(position: Vec3, yaw: f64, velocity: Option<Vec3>) -> Transform {
        let mut tracker = TransformTracker::new("T".to_string());
        let make = |t: f64, p: Vec3| ObservationSnapshot {
            timestamp: t,
            entities: vec![ObservedEntity {
                id: "T_id".to_string(),
                name: "T".to_string(),
                position: p,
                yaw,
                pitch: 0.0,
            }],
        };
        tracker.update(&make(0.0, position));
        if let Some(v) = velocity {
            tracker.update(&make(1.0, position + v));
        }
        tracker.transform().cloned().expect("transform")
    }

    #[test]
    fn test_solve_aim_empty_store_uses_fallbacks() {
        let shooter = transform_at(Vec3::new(0.0, 4.0, 0.0), 0.0, None);
        let target = transform_at(Vec3::new(0.0, 4.0, 20.0), 180.0, None);
        let store = CalibrationStore::default();
        let config = CalibrationConfig::default();
        let mut rng = StdRng::seed_from_u64(3);

        let (solution, context) = solve_aim(&shooter, &target, &store, &config, 6.0, &mut rng);

        // 垂直補正は段階探索ステップそのまま（leading=0）→ pitchは-6度
        assert!((solution.desired_pitch + 6.0).abs() < 1e-9);
        // 水平補正はランダム探索なので正規化範囲のみ確認
        assert!((-180.0..=180.0).contains(&solution.desired_yaw));
        assert_eq!(context.release_yaw, 0.0);
    }

    #[test]
    fn test_velocity_decomposition_signs() {
        let shooter = transform_at(Vec3::new(0.0, 4.0, 0.0), 0.0, None);
        // 真正面（+Z）20mのターゲットが自機へ向かって移動（-Z）
        let target = transform_at(
            Vec3::new(0.0, 4.0, 20.0),
            180.0,
            Some(Vec3::new(0.0, 0.0, -2.0)),
        );
        let store = CalibrationStore::default();
        let config = CalibrationConfig::default();
        let mut rng = StdRng::seed_from_u64(3);

        let (_, context) = solve_aim(&shooter, &target, &store, &config, 0.0, &mut rng);

        // 方位角0度 → 前後基底は+Z。自機へ向かう移動は前後成分が負
        assert!(context.forward_velocity < 0.0);
        assert!((context.forward_velocity + 2.0).abs() < 1e-9);
        assert!(context.lateral_velocity.abs() < 1e-9);
        assert!(context.vertical_velocity.abs() < 1e-9);
    }

    #[test]
    fn test_reconstruct_velocity_roundtrip_on_bearing() {
        // 自機ヨーが方位角と一致している場合、分解→再構成は元の速度へ戻る
        let shooter = transform_at(Vec3::new(0.0, 4.0, 0.0), 0.0, None);
        let original_velocity = Vec3::new(1.5, -0.5, 2.0);
        let target = transform_at(
            Vec3::new(0.0, 4.0, 20.0),
            180.0,
            Some(original_velocity),
        );
        let store = CalibrationStore::default();
        let config = CalibrationConfig::default();
        let mut rng = StdRng::seed_from_u64(3);

        let (_, context) = solve_aim(&shooter, &target, &store, &config, 0.0, &mut rng);
        let reconstructed = reconstruct_velocity(&context);

        assert!((reconstructed.x - original_velocity.x).abs() < 1e-9);
        assert!((reconstructed.y - original_velocity.y).abs() < 1e-9);
        assert!((reconstructed.z - original_velocity.z).abs() < 1e-9);
    }
}
