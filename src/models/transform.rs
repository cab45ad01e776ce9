use std::collections::VecDeque;

use crate::host::ObservationSnapshot;
use crate::models::common::Vec3;
use tracing::warn;

/// 位置履歴の保持数
const HISTORY_CAPACITY: usize = 4;

/// エンティティの姿勢と導出速度
///
/// 観測がそのエンティティを含むティックごとに全体が置き換えられます。
/// 速度は直近の位置履歴（最大4件）の最古サンプルとの有限差分で導出され、
/// サンプルが2つ揃うまでは未定義（None）です。
#[derive(Debug, Clone)]
pub struct Transform {
    /// 観測された位置
    pub position: Vec3,
    /// ヨー角（度）
    pub yaw: f64,
    /// ピッチ角（度、下向き正）
    pub pitch: f64,
    /// 有限差分による速度（m/s）、履歴不足の間はNone
    pub velocity: Option<Vec3>,
    /// この姿勢が観測されたバッチ時刻（秒）
    pub timestamp: f64,
    /// 過去位置と時刻の履歴（古い順、最大4件）
    history: VecDeque<(Vec3, f64)>,
}

impl Transform {
    /// 速度（未確定の場合はゼロベクトル）
    pub fn velocity_or_zero(&self) -> Vec3 {
        self.velocity.unwrap_or_default()
    }

    /// 保持している履歴サンプル数
    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

/// 1エンティティの姿勢を追跡するトラッカー
///
/// 観測スナップショットから名前でエンティティを探し、姿勢を更新します。
/// スナップショットに名前が無いティックは何もしません（姿勢は陳腐化し、
/// 呼び出し側が鮮度を確認する責務を負います）。
#[derive(Debug, Clone)]
pub struct TransformTracker {
    entity_name: String,
    transform: Option<Transform>,
}

impl TransformTracker {
    pub fn new(entity_name: String) -> Self {
        Self {
            entity_name,
            transform: None,
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// 1ティック分の観測を取り込む
    ///
    /// エンティティが観測に含まれない場合は何もしません（エラーにしない）。
    /// 必須フィールドが不正な観測は境界で拒否し、姿勢を陳腐化したまま残します。
    pub fn update(&mut self, snapshot: &ObservationSnapshot) {
        let Some(entity) = snapshot.find_by_name(&self.entity_name) else {
            return;
        };

        if !entity.is_well_formed() {
            warn!(
                entity_name = %self.entity_name,
                entity_id = %entity.id,
                "TRANSFORM_REJECTED: 不正な観測エンティティを拒否しました"
            );
            return;
        }

        match self.transform.as_mut() {
            Some(transform) => {
                // 直前の位置・時刻を履歴に退避（最大4件、最古から追い出す）
                transform.history.push_back((transform.position, transform.timestamp));
                while transform.history.len() > HISTORY_CAPACITY {
                    transform.history.pop_front();
                }

                let previous_velocity = transform.velocity;
                transform.position = entity.position;
                transform.yaw = entity.yaw;
                transform.pitch = entity.pitch;
                transform.timestamp = snapshot.timestamp;

                // 履歴の最古サンプルとの有限差分で速度を導出
                if let Some(&(oldest_pos, oldest_time)) = transform.history.front() {
                    let dt = transform.timestamp - oldest_time;
                    if dt > 0.0 {
                        transform.velocity = Some(Vec3::new(
                            (transform.position.x - oldest_pos.x) / dt,
                            (transform.position.y - oldest_pos.y) / dt,
                            (transform.position.z - oldest_pos.z) / dt,
                        ));
                    } else {
                        // 時刻差ゼロでは割らず、直前の速度を保持
                        transform.velocity = previous_velocity;
                    }
                }
            }
            None => {
                self.transform = Some(Transform {
                    position: entity.position,
                    yaw: entity.yaw,
                    pitch: entity.pitch,
                    velocity: None,
                    timestamp: snapshot.timestamp,
                    history: VecDeque::with_capacity(HISTORY_CAPACITY + 1),
                });
            }
        }
    }

    /// 現在の姿勢（陳腐化している可能性あり）
    pub fn transform(&self) -> Option<&Transform> {
        self.transform.as_ref()
    }

    /// 指定時刻の観測で更新済みの場合のみ姿勢を返す
    pub fn fresh(&self, timestamp: f64) -> Option<&Transform> {
        self.transform.as_ref().filter(|t| t.timestamp == timestamp)
    }

    /// エピソード開始時の状態クリア
    pub fn clear(&mut self) {
        self.transform = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ObservedEntity;

    fn snapshot_at(timestamp: f64, name: &str, position: Vec3) -> ObservationSnapshot {
        ObservationSnapshot {
            timestamp,
            entities: vec![ObservedEntity {
                id: format!("{}_id", name),
                name: name.to_string(),
                position,
                yaw: 0.0,
                pitch: 0.0,
            }],
        }
    }

    #[test]
    fn test_velocity_undefined_until_two_samples() {
        let mut tracker = TransformTracker::new("Mover".to_string());
        tracker.update(&snapshot_at(0.0, "Mover", Vec3::new(0.0, 4.0, 0.0)));
        assert!(tracker.transform().unwrap().velocity.is_none());

        tracker.update(&snapshot_at(0.05, "Mover", Vec3::new(1.0, 4.0, 0.0)));
        let velocity = tracker.transform().unwrap().velocity.unwrap();
        assert!((velocity.x - 20.0).abs() < 1e-9);
        assert_eq!(velocity.y, 0.0);
    }

    #[test]
    fn test_velocity_zero_for_identical_positions() {
        let mut tracker = TransformTracker::new("Mover".to_string());
        let position = Vec3::new(3.0, 4.0, 5.0);
        tracker.update(&snapshot_at(0.0, "Mover", position));
        tracker.update(&snapshot_at(0.05, "Mover", position));
        let velocity = tracker.transform().unwrap().velocity.unwrap();
        assert_eq!(velocity, Vec3::new(0.0, 0.0, 0.0));
    }

    #[test]
    fn test_absent_entity_leaves_transform_stale() {
        let mut tracker = TransformTracker::new("Mover".to_string());
        tracker.update(&snapshot_at(0.0, "Mover", Vec3::new(1.0, 4.0, 1.0)));

        let other = snapshot_at(0.05, "Somebody", Vec3::new(9.0, 9.0, 9.0));
        tracker.update(&other);

        let transform = tracker.transform().unwrap();
        assert_eq!(transform.timestamp, 0.0);
        assert_eq!(transform.position, Vec3::new(1.0, 4.0, 1.0));
        assert!(tracker.fresh(0.05).is_none());
        assert!(tracker.fresh(0.0).is_some());
    }

    #[test]
    fn test_history_capped_at_four() {
        let mut tracker = TransformTracker::new("Mover".to_string());
        for i in 0..10 {
            let t = i as f64 * 0.05;
            tracker.update(&snapshot_at(t, "Mover", Vec3::new(i as f64, 4.0, 0.0)));
        }
        assert_eq!(tracker.transform().unwrap().history_len(), 4);

        // 速度は最古の履歴サンプル（4ティック前）との差分
        let velocity = tracker.transform().unwrap().velocity.unwrap();
        assert!((velocity.x - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_malformed_entity_rejected() {
        let mut tracker = TransformTracker::new("Mover".to_string());
        tracker.update(&snapshot_at(0.0, "Mover", Vec3::new(1.0, 4.0, 1.0)));

        let mut bad = snapshot_at(0.05, "Mover", Vec3::new(f64::NAN, 4.0, 1.0));
        bad.entities[0].position.x = f64::NAN;
        tracker.update(&bad);

        let transform = tracker.transform().unwrap();
        assert_eq!(transform.timestamp, 0.0);
    }

    #[test]
    fn test_zero_time_delta_keeps_previous_velocity() {
        let mut tracker = TransformTracker::new("Mover".to_string());
        tracker.update(&snapshot_at(0.0, "Mover", Vec3::new(0.0, 4.0, 0.0)));
        tracker.update(&snapshot_at(0.0, "Mover", Vec3::new(1.0, 4.0, 0.0)));
        // 時刻差ゼロでは有限差分を取らない
        assert!(tracker.transform().unwrap().velocity.is_none());
    }
}
