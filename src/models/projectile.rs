use tracing::debug;

use crate::host::ObservationSnapshot;
use crate::models::aim::ReleaseContext;
use crate::models::common::Vec3;

/// 照準中の1ティック分の記録
#[derive(Debug, Clone, Copy)]
pub struct AimSample {
    /// 自機ヨー（度、正規化済み）
    pub yaw: f64,
    /// 照準ピッチ（度、上向き正）
    pub aim_pitch: f64,
    /// 観測バッチ時刻（秒）
    pub timestamp: f64,
}

/// 1ショット分の発射スナップショット
///
/// 発射リリース時点で確定し、発射体トラックに引き渡されます。
#[derive(Debug, Clone)]
pub struct ShotRelease {
    /// 照準計算時点の速度分解スナップショット
    pub context: ReleaseContext,
    /// 発射時の目標ピッチ（度、ホスト規約の下向き正）
    pub desired_pitch: f64,
    /// この照準フェーズの全ティックの照準記録（先頭=照準開始、末尾=リリース）
    pub aim_trace: Vec<AimSample>,
}

/// 発射体トラックの1ティック処理の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    /// 追跡継続中
    Tracking,
    /// ターゲットが消失したため分析せず破棄
    TargetLost,
    /// ティック予算を使い切ったため分析へ引き渡す
    Completed,
}

/// 発射された1本の発射体とペアのターゲット位置を追跡するトラック
///
/// 発射体が初めて観測されたときに生成され、ターゲット消失（分析なし）
/// またはティック予算の枯渇（分析あり）で破棄されます。重複位置の
/// ティックはサンプルとして記録しません。
#[derive(Debug, Clone)]
pub struct ProjectileTrack {
    projectile_id: String,
    target_id: String,
    remaining_ticks: u32,
    projectile_samples: Vec<(Vec3, f64)>,
    target_samples: Vec<(Vec3, f64)>,
    release: ShotRelease,
}

impl ProjectileTrack {
    pub fn new(projectile_id: String, target_id: String, budget_ticks: u32, release: ShotRelease) -> Self {
        debug!(
            projectile_id = %projectile_id,
            target_id = %target_id,
            budget_ticks = budget_ticks,
            "TRACK_STARTED: 発射体の追跡を開始しました"
        );
        Self {
            projectile_id,
            target_id,
            remaining_ticks: budget_ticks,
            projectile_samples: Vec::new(),
            target_samples: Vec::new(),
            release,
        }
    }

    /// 1ティック分の追跡処理
    ///
    /// ターゲットが観測に含まれない場合は即座に追跡を打ち切ります。
    /// 予算が残っている間は発射体位置を記録し（直前サンプルと同一位置の
    /// 場合は抑制）、予算枯渇で完了を返します。
    pub fn step(&mut self, snapshot: &ObservationSnapshot) -> TrackStatus {
        let Some(target) = snapshot.find_by_id(&self.target_id) else {
            debug!(
                projectile_id = %self.projectile_id,
                target_id = %self.target_id,
                samples = self.projectile_samples.len(),
                "TRACK_TARGET_LOST: ターゲット消失のためトラックを破棄します"
            );
            return TrackStatus::TargetLost;
        };

        if self.remaining_ticks == 0 {
            return TrackStatus::Completed;
        }
        self.remaining_ticks -= 1;

        if let Some(projectile) = snapshot.find_by_id(&self.projectile_id) {
            let duplicate = self
                .projectile_samples
                .last()
                .is_some_and(|(last, _)| *last == projectile.position);
            if !duplicate {
                self.projectile_samples.push((projectile.position, snapshot.timestamp));
                self.target_samples.push((target.position, snapshot.timestamp));
            }
        }

        TrackStatus::Tracking
    }

    pub fn projectile_id(&self) -> &str {
        &self.projectile_id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn projectile_samples(&self) -> &[(Vec3, f64)] {
        &self.projectile_samples
    }

    pub fn target_samples(&self) -> &[(Vec3, f64)] {
        &self.target_samples
    }

    pub fn release(&self) -> &ShotRelease {
        &self.release
    }
}
