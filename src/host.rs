//! # Host モジュール
//!
//! シミュレーションホストとの境界インターフェースを定義します。
//!
//! コア側はこのモジュールの型とtraitだけを通してホストと会話します。
//! 観測スナップショットの取得、連続回転コマンド、発射チャージのトグル、
//! および将来ティックに予約される管理系チャットコマンドをここで扱います。
//! 接続やリトライの実装はホスト側の責務であり、このモジュールには
//! 含まれません。

use crate::models::common::Vec3;

/// 1ティック分の観測に含まれる1エンティティの状態
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedEntity {
    /// エンティティの一意識別子
    pub id: String,
    /// エンティティの種別名（エージェント名・発射体種別など）
    pub name: String,
    /// 観測された位置
    pub position: Vec3,
    /// ヨー角（度）
    pub yaw: f64,
    /// ピッチ角（度、下向き正）
    pub pitch: f64,
}

impl ObservedEntity {
    /// 必須フィールドが全て有限値かどうかを検証
    pub fn is_well_formed(&self) -> bool {
        !self.id.is_empty() && self.position.is_finite() && self.yaw.is_finite() && self.pitch.is_finite()
    }
}

/// 1ティック分の観測スナップショット
#[derive(Debug, Clone, Default)]
pub struct ObservationSnapshot {
    /// 観測バッチの時刻（秒）
    pub timestamp: f64,
    /// 観測されたエンティティ一覧
    pub entities: Vec<ObservedEntity>,
}

impl ObservationSnapshot {
    /// 名前でエンティティを検索
    pub fn find_by_name(&self, name: &str) -> Option<&ObservedEntity> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// IDでエンティティを検索
    pub fn find_by_id(&self, id: &str) -> Option<&ObservedEntity> {
        self.entities.iter().find(|e| e.id == id)
    }

    /// 既知集合に含まれない指定種別のエンティティを検索
    ///
    /// 発射直後の新しい発射体の特定に使用します。最初に一致したものを返します。
    pub fn find_new_projectile<'a>(
        &'a self,
        type_name: &str,
        known_ids: &std::collections::HashSet<String>,
    ) -> Option<&'a ObservedEntity> {
        self.entities
            .iter()
            .find(|e| e.name == type_name && !known_ids.contains(&e.id))
    }
}

/// 観測取得の1回分の結果
#[derive(Debug, Clone)]
pub enum HostPoll {
    /// 新しいスナップショットが利用可能
    Snapshot(ObservationSnapshot),
    /// まだ観測が届いていない（再ポーリング対象）
    Pending,
    /// ミッションが終了した
    MissionEnded,
}

/// ホスト側で発生したエラー
#[derive(Debug)]
pub enum HostError {
    /// 観測ストリームにエラーが報告された
    ObservationError(String),
    /// コマンド送信に失敗した
    CommandError(String),
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostError::ObservationError(msg) => {
                write!(f, "観測取得エラー: {}", msg)
            }
            HostError::CommandError(msg) => {
                write!(f, "コマンド送信エラー: {}", msg)
            }
        }
    }
}

impl std::error::Error for HostError {}

/// 観測スナップショットの供給元インターフェース
pub trait ObservationSource {
    /// 次のスナップショットの取得を試みる（ブロックしない）
    fn poll(&mut self) -> Result<HostPoll, HostError>;
}

/// ホストへのコマンド送信インターフェース
pub trait CommandSink {
    /// 連続ヨー回転コマンド（-1.0〜1.0、最大旋回速度に対する割合）
    fn turn(&mut self, rate: f64);

    /// 連続ピッチ回転コマンド（-1.0〜1.0）
    fn pitch(&mut self, rate: f64);

    /// 発射チャージのトグル（true=チャージ開始、false=リリース）
    fn set_fire(&mut self, charging: bool);

    /// 管理系チャットコマンドの即時送信
    fn chat(&mut self, command: &str);
}

/// 観測供給とコマンド送信を兼ねるホスト
pub trait SimulationHost: ObservationSource + CommandSink {}

impl<T: ObservationSource + CommandSink> SimulationHost for T {}

/// 将来ティックに予約された管理コマンド
#[derive(Debug, Clone)]
pub struct ScheduledCommand {
    /// 送信するチャットコマンド文字列
    pub command: String,
    /// 実行予定ティック
    pub due_tick: u64,
}

/// 予約コマンドのキュー
///
/// エピソード開始時のインベントリリセットやエンティティ掃除など、
/// 指定ティック到来時に1回だけ実行されるコマンドを保持します。
#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: Vec<ScheduledCommand>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// コマンドを予約
    pub fn schedule(&mut self, command: String, due_tick: u64) {
        self.pending.push(ScheduledCommand { command, due_tick });
    }

    /// 期限が到来したコマンドを送信して取り除く
    pub fn process(&mut self, current_tick: u64, sink: &mut dyn CommandSink) {
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].due_tick <= current_tick {
                let scheduled = self.pending.remove(i);
                sink.chat(&scheduled.command);
            } else {
                i += 1;
            }
        }
    }

    /// 未実行コマンドを全て破棄
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        chats: Vec<String>,
    }

    impl CommandSink for RecordingSink {
        fn turn(&mut self, _rate: f64) {}
        fn pitch(&mut self, _rate: f64) {}
        fn set_fire(&mut self, _charging: bool) {}
        fn chat(&mut self, command: &str) {
            self.chats.push(command.to_string());
        }
    }

    #[test]
    fn test_command_queue_fires_once_when_due() {
        let mut queue = CommandQueue::new();
        let mut sink = RecordingSink { chats: Vec::new() };
        queue.schedule("/clean".to_string(), 5);
        queue.schedule("/reset".to_string(), 0);

        queue.process(0, &mut sink);
        assert_eq!(sink.chats, vec!["/reset".to_string()]);
        assert_eq!(queue.len(), 1);

        queue.process(4, &mut sink);
        assert_eq!(sink.chats.len(), 1);

        queue.process(5, &mut sink);
        assert_eq!(sink.chats, vec!["/reset".to_string(), "/clean".to_string()]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_find_new_projectile_skips_known_ids() {
        let mut known = std::collections::HashSet::new();
        known.insert("a1".to_string());
        let snapshot = ObservationSnapshot {
            timestamp: 0.0,
            entities: vec![
                ObservedEntity {
                    id: "a1".to_string(),
                    name: "Arrow".to_string(),
                    position: Vec3::default(),
                    yaw: 0.0,
                    pitch: 0.0,
                },
                ObservedEntity {
                    id: "a2".to_string(),
                    name: "Arrow".to_string(),
                    position: Vec3::default(),
                    yaw: 0.0,
                    pitch: 0.0,
                },
            ],
        };
        let found = snapshot.find_new_projectile("Arrow", &known);
        assert_eq!(found.map(|e| e.id.as_str()), Some("a2"));
    }

    #[test]
    fn test_malformed_entity_detection() {
        let entity = ObservedEntity {
            id: "e1".to_string(),
            name: "Mover".to_string(),
            position: Vec3::new(f64::NAN, 0.0, 0.0),
            yaw: 0.0,
            pitch: 0.0,
        };
        assert!(!entity.is_well_formed());
    }
}
