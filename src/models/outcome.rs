use tracing::{debug, info};

use crate::models::aim::reconstruct_velocity;
use crate::models::calibration::CalibrationStore;
use crate::models::common::{math_utils, Vec3};
use crate::models::projectile::ProjectileTrack;
use crate::models::shooter::{MotionRegime, ShooterSession};
use crate::scenario::CalibrationConfig;

/// 命中判定に必要な距離反転回数
const HIT_REVERSAL_THRESHOLD: u32 = 4;

/// 垂直サンプルを採用する発射ピッチ上限（度、ホスト規約）
const RELEASE_PITCH_SANITY_DEG: f64 = 85.0;

/// 水平サンプルを採用する照準ピッチ範囲（度、上向き正、開区間）
const HORIZONTAL_PITCH_GATE_DEG: (f64, f64) = (-45.0, 80.0);

/// 1ショットの分析結果
#[derive(Debug, Clone, Copy)]
pub struct ShotOutcome {
    /// 命中と分類されたか
    pub hit: bool,
    /// 最接近点での符号付き垂直誤差（m）
    pub vertical_error: f64,
    /// 最接近点での水平誤差（m）
    pub horizontal_error: f64,
    /// ショットのスカラー報酬（2次元ミスベクトル長の負値）
    pub reward: f64,
}

/// 完了した発射体トラックを分析して較正データへ変換する
///
/// 発射時コンテキストからターゲットの推定速度を再構成し、各サンプルを
/// 「逸らされなかった場合」の位置へ逆外挿して照準誤差残差を計算します。
/// 自機からの水平距離が減少に転じた回数が閾値に達した場合は命中と分類し、
/// このショットで追記した較正行を分析開始時のマーカーまで一括破棄します
/// （停止した軌道は外れ補正の教師データにならないため）。
///
/// # 引数
///
/// * `session` - ショット統計とモーション領域を保持するセッション
/// * `store` - 較正ストア（追記・ロールバック両方の対象）
/// * `config` - 較正モデル設定
/// * `shooter_position` - 分析時点の自機位置
/// * `track` - 完了したトラック
///
/// # 戻り値
///
/// 分析できた場合はショット結果、軌道サンプルが無い場合はNone
pub fn analyze_trajectory(
    session: &mut ShooterSession,
    store: &mut CalibrationStore,
    config: &CalibrationConfig,
    shooter_position: Vec3,
    track: &ProjectileTrack,
) -> Option<ShotOutcome> {
    session.total_shots += 1;
    session.episode_shots += 1;

    let samples = track.projectile_samples();
    let release = track.release();
    let Some(aim_start) = release.aim_trace.first().copied() else {
        return None;
    };
    let Some(release_sample) = release.aim_trace.last().copied() else {
        return None;
    };
    if samples.is_empty() {
        return None;
    }

    let release_pitch = release_sample.aim_pitch;
    let predicted_velocity = reconstruct_velocity(&release.context);

    // ロールバック境界: このショットの分析開始時点
    let vs_marker = store.vertical_static.mark();
    let vl_marker = store.vertical_leading.mark();
    let hs_marker = store.horizontal_static.mark();
    let hl_marker = store.horizontal_leading.mark();

    let mut reversal_count = 0u32;
    let mut last_flat_distance = 0.0;
    let mut hit = false;

    for (i, (projectile_pos, timestamp)) in samples.iter().enumerate() {
        let duplicate = i > 0 && *projectile_pos == samples[i - 1].0;
        if release.desired_pitch >= RELEASE_PITCH_SANITY_DEG || duplicate {
            continue;
        }

        // 発射時の推定等速運動を巻き戻した「逸らされなかった場合」の位置
        let elapsed = timestamp - aim_start.timestamp;
        let past = *projectile_pos - predicted_velocity * elapsed;

        let observed_bearing_delta = math_utils::normalize_angle(
            math_utils::bearing_deg(shooter_position.x, shooter_position.z, projectile_pos.x, projectile_pos.z)
                - aim_start.yaw,
        );
        let past_bearing = math_utils::bearing_deg(shooter_position.x, shooter_position.z, past.x, past.z);
        let predicted_bearing_delta = math_utils::normalize_angle(past_bearing - aim_start.yaw);

        // 観測位置と逆外挿位置それぞれへの必要ピッチ（現行モデルで評価）
        let observed_pitch = store.pitch_to_target(
            config,
            shooter_position.flat_distance(projectile_pos),
            projectile_pos.y - shooter_position.y,
            session.vert_step_deg,
        );
        let predicted_pitch = store.pitch_to_target(
            config,
            shooter_position.flat_distance(&past),
            past.y - shooter_position.y,
            session.vert_step_deg,
        );

        let past_lateral = math_utils::signed_projection(
            &predicted_velocity,
            &math_utils::vector_from_yaw(math_utils::normalize_angle(past_bearing + 90.0)),
        );
        let past_forward = math_utils::signed_projection(
            &predicted_velocity,
            &math_utils::vector_from_yaw(past_bearing),
        );

        let elevation = past.y - shooter_position.y;
        let flat_distance = shooter_position.flat_distance(&past);

        // 自機からの水平距離の反転検出（3サンプル目以降）
        let current_flat_distance = shooter_position.flat_distance(projectile_pos);
        if i > 1 && current_flat_distance < last_flat_distance {
            reversal_count += 1;
        }

        if reversal_count >= HIT_REVERSAL_THRESHOLD {
            // 命中: このショット分の行を全系列でマーカーまで破棄
            store.vertical_static.rollback_to(vs_marker);
            store.vertical_leading.rollback_to(vl_marker);
            store.horizontal_static.rollback_to(hs_marker);
            store.horizontal_leading.rollback_to(hl_marker);
            hit = true;
            break;
        }
        last_flat_distance = current_flat_distance;

        store.vertical_static.append(&[flat_distance, elevation], release_pitch);
        if session.vertical_regime == MotionRegime::Moving {
            store.vertical_leading.append(
                &[flat_distance, elevation, release.context.vertical_velocity],
                observed_pitch - predicted_pitch,
            );
        }

        if release_pitch > HORIZONTAL_PITCH_GATE_DEG.0 && release_pitch < HORIZONTAL_PITCH_GATE_DEG.1 {
            store.horizontal_static.append(
                &[predicted_bearing_delta],
                math_utils::normalize_angle(release_sample.yaw - aim_start.yaw),
            );
            if session.horizontal_regime == MotionRegime::Moving {
                store.horizontal_leading.append(
                    &[flat_distance, past_lateral, past_forward],
                    math_utils::normalize_angle(observed_bearing_delta - predicted_bearing_delta),
                );
            }
        }
    }

    // 時刻整合済みの2系列間の最接近点からミス成分を計算
    let (closest_projectile, closest_target) =
        closest_point_pair(samples, track.target_samples())?;
    let vertical_error = closest_projectile.y - closest_target.y;
    let horizontal_error = closest_projectile.flat_distance(&closest_target);
    let reward = -(vertical_error.powi(2) + horizontal_error.powi(2)).sqrt();

    if hit {
        session.total_hits += 1;
        session.episode_hits += 1;
    }
    session.vertical_errors.push(vertical_error);
    session.horizontal_errors.push(horizontal_error);

    info!(
        projectile_id = %track.projectile_id(),
        target_id = %track.target_id(),
        hit = hit,
        reversal_count = reversal_count,
        vertical_error = vertical_error,
        horizontal_error = horizontal_error,
        reward = reward,
        samples = samples.len(),
        "SHOT_ANALYZED: ショットを分析しました"
    );

    Some(ShotOutcome {
        hit,
        vertical_error,
        horizontal_error,
        reward,
    })
}

/// 2つの時刻整合済み軌道の最接近点対を求める
///
/// 同一インデックス同士の距離が最小となる点対を返します。
/// いずれかが空の場合はNoneです。
fn closest_point_pair(
    curve: &[(Vec3, f64)],
    target: &[(Vec3, f64)],
) -> Option<(Vec3, Vec3)> {
    let mut pairs = curve.iter().zip(target.iter());
    let (first_curve, first_target) = pairs.next()?;
    let mut best = (first_curve.0, first_target.0);
    let mut min_distance = first_curve.0.distance(&first_target.0);

    for (c, t) in pairs {
        let distance = c.0.distance(&t.0);
        if distance < min_distance {
            min_distance = distance;
            best = (c.0, t.0);
        }
    }

    debug!(
        min_distance = min_distance,
        "CLOSEST_APPROACH: 最接近距離を計算しました"
    );
    Some(best)
}
