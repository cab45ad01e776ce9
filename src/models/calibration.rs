use std::fs;
use std::path::{Path, PathBuf};

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::scenario::CalibrationConfig;

/// 較正テーブルのコミット位置マーカー
///
/// 1ショット分の分析開始時点のテーブル長を記録し、命中判定時の
/// 一括ロールバック境界として使用します。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitMarker(usize);

/// 追記専用の較正サンプルテーブル
///
/// 各行は固定幅の特徴量ベクトルと末尾1個の目標角で構成されます。
/// 挿入順が保存されるため、マーカーによるロールバックが定義できます。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalibrationTable {
    rows: Vec<Vec<f64>>,
}

impl CalibrationTable {
    /// サンプルを末尾に追記
    pub fn append(&mut self, features: &[f64], target: f64) {
        let mut row = features.to_vec();
        row.push(target);
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 現在のテーブル長をマーカーとして記録
    pub fn mark(&self) -> CommitMarker {
        CommitMarker(self.rows.len())
    }

    /// マーカー以降に追記された行を全て取り除く
    ///
    /// マーカーが現在長を超える場合は構築上発生しないはずの
    /// 不変条件違反であり、警告を出して何もしません。
    pub fn rollback_to(&mut self, marker: CommitMarker) {
        if marker.0 > self.rows.len() {
            warn!(
                marker = marker.0,
                table_len = self.rows.len(),
                "CALIBRATION_ROLLBACK_INVALID: 現在長を超えるマーカーへのロールバック要求"
            );
            return;
        }
        let removed = self.rows.len() - marker.0;
        self.rows.truncate(marker.0);
        if removed > 0 {
            debug!(
                removed_rows = removed,
                table_len = self.rows.len(),
                "CALIBRATION_ROLLBACK: 直近ショット分のサンプルを破棄しました"
            );
        }
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    fn features_of(row: &[f64]) -> &[f64] {
        &row[..row.len() - 1]
    }

    fn target_of(row: &[f64]) -> f64 {
        row[row.len() - 1]
    }

    /// 目標角列の最小値と最大値
    pub fn target_range(&self) -> Option<(f64, f64)> {
        let mut iter = self.rows.iter().map(|row| Self::target_of(row));
        let first = iter.next()?;
        let mut min = first;
        let mut max = first;
        for target in iter {
            min = min.min(target);
            max = max.max(target);
        }
        Some((min, max))
    }
}

/// 4系列の較正サンプルを保持するストア
///
/// 垂直/水平 × 静的/先行補正の4テーブル。エピソードをまたいで保持され、
/// 外部コラボレータが不透明な数値テーブルとして永続化します。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationStore {
    pub vertical_static: CalibrationTable,
    pub vertical_leading: CalibrationTable,
    pub horizontal_static: CalibrationTable,
    pub horizontal_leading: CalibrationTable,
}

impl CalibrationStore {
    /// YAMLファイルからストアを読み込み
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationIoError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CalibrationIoError::FileNotFound(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)
            .map_err(|e| CalibrationIoError::IoError(path.to_path_buf(), e))?;
        let store: CalibrationStore = serde_yaml::from_str(&contents)
            .map_err(|e| CalibrationIoError::ParseError(path.to_path_buf(), e))?;
        Ok(store)
    }

    /// ストアをYAMLファイルへ保存
    ///
    /// 保存先の親ディレクトリが存在しない場合は作成します。
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CalibrationIoError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| CalibrationIoError::IoError(path.to_path_buf(), e))?;
            }
        }
        let contents = serde_yaml::to_string(self)
            .map_err(|e| CalibrationIoError::ParseError(path.to_path_buf(), e))?;
        fs::write(path, contents).map_err(|e| CalibrationIoError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// 全テーブルの合計サンプル数
    pub fn total_len(&self) -> usize {
        self.vertical_static.len()
            + self.vertical_leading.len()
            + self.horizontal_static.len()
            + self.horizontal_leading.len()
    }

    /// 垂直静的テーブルの目標角の広がり（max - min）
    ///
    /// 事前読み込みしたデータセットが粗い探索段階を終えているかの判定に
    /// 使用します。空のテーブルではNoneを返します。
    pub fn vertical_target_span(&self) -> Option<f64> {
        self.vertical_static.target_range().map(|(min, max)| max - min)
    }

    /// 垂直静的モデル: ターゲットの現在位置へ命中させるピッチ角を予測
    ///
    /// サンプル数が閾値以下の間は粗い段階探索のステップ角をそのまま返します。
    /// 閾値超過後は、問い合わせ形状が急角（elevation > distance）かどうかで
    /// テーブルを2部分集合に分割し、選択側だけで3次多項式回帰を行います。
    /// 選択した部分集合が空の場合もステップ角にフォールバックします。
    pub fn pitch_to_target(
        &self,
        config: &CalibrationConfig,
        distance: f64,
        elevation: f64,
        fallback_step_deg: f64,
    ) -> f64 {
        let table = &self.vertical_static;
        if table.len() <= config.vertical_fit_threshold {
            return fallback_step_deg;
        }

        let steep = elevation > distance;
        let subset: Vec<&Vec<f64>> = table
            .rows()
            .iter()
            .filter(|row| {
                let angle = CalibrationTable::target_of(row);
                if steep {
                    angle > config.steep_split_deg
                } else {
                    angle <= config.steep_split_deg
                }
            })
            .collect();

        if subset.is_empty() {
            return fallback_step_deg;
        }

        match ols_predict(&subset, &|f| polynomial_features(f, 3), &[distance, elevation]) {
            Some(prediction) => prediction.min(config.max_pitch_deg),
            None => {
                warn!(
                    table = "vertical_static",
                    rows = subset.len(),
                    "CALIBRATION_FIT_FAILED: 回帰に失敗したためフォールバックを使用します"
                );
                fallback_step_deg
            }
        }
    }

    /// 垂直先行補正モデル: 移動ターゲットへの追加ピッチ角を予測
    ///
    /// 符号保存2次展開を使用します。サンプル不足の間は補正なし（0度）。
    pub fn leading_pitch(
        &self,
        config: &CalibrationConfig,
        distance: f64,
        elevation: f64,
        vertical_velocity: f64,
    ) -> f64 {
        let table = &self.vertical_leading;
        if table.len() <= config.leading_fit_threshold {
            return 0.0;
        }

        let subset: Vec<&Vec<f64>> = table.rows().iter().collect();
        match ols_predict(
            &subset,
            &signed_quadratic_features,
            &[distance, elevation, vertical_velocity],
        ) {
            Some(prediction) => prediction.min(config.max_pitch_deg),
            None => 0.0,
        }
    }

    /// 水平静的モデル: ターゲットの現在位置へ向けるヨー補正角を予測
    ///
    /// サンプル不足の間はモデルが存在しないため[-180, 180)度の一様乱数で
    /// ランダム探索します。閾値超過後は1次回帰です。
    pub fn yaw_to_target<R: Rng>(
        &self,
        config: &CalibrationConfig,
        bearing_delta: f64,
        rng: &mut R,
    ) -> f64 {
        let table = &self.horizontal_static;
        if table.len() <= config.horizontal_fit_threshold {
            return rng.gen_range(-180.0..180.0);
        }

        let subset: Vec<&Vec<f64>> = table.rows().iter().collect();
        match ols_predict(&subset, &|f| polynomial_features(f, 1), &[bearing_delta]) {
            Some(prediction) => prediction.clamp(-180.0, 180.0),
            None => rng.gen_range(-180.0..180.0),
        }
    }

    /// 水平先行補正モデル: 移動ターゲットへの追加ヨー角を予測
    pub fn leading_yaw(
        &self,
        config: &CalibrationConfig,
        distance: f64,
        lateral_velocity: f64,
        forward_velocity: f64,
    ) -> f64 {
        let table = &self.horizontal_leading;
        if table.len() <= config.leading_fit_threshold {
            return 0.0;
        }

        let subset: Vec<&Vec<f64>> = table.rows().iter().collect();
        match ols_predict(
            &subset,
            &signed_quadratic_features,
            &[distance, lateral_velocity, forward_velocity],
        ) {
            Some(prediction) => prediction.clamp(-180.0, 180.0),
            None => 0.0,
        }
    }
}

/// 多項式特徴量展開（バイアス項なし）
///
/// 次数1..=degreeの全単項式を、同次数内ではインデックスの重複組合せ順で
/// 列挙します。degree=2, [a, b, c] → [a, b, c, a², ab, ac, b², bc, c²]。
pub fn polynomial_features(features: &[f64], degree: usize) -> Vec<f64> {
    fn monomials(features: &[f64], remaining: usize, start: usize, product: f64, out: &mut Vec<f64>) {
        if remaining == 0 {
            out.push(product);
            return;
        }
        for i in start..features.len() {
            monomials(features, remaining - 1, i, product * features[i], out);
        }
    }

    let mut out = Vec::new();
    for d in 1..=degree {
        monomials(features, d, 0, 1.0, &mut out);
    }
    out
}

/// 符号保存2次展開
///
/// 通常の2次展開と同じ構成で、純粋な平方項だけは元の線形特徴量の符号を
/// 引き継ぎます（sign(v)·v²）。逆方向の移動に対する非対称な補正を
/// 表現可能にするための展開です。
pub fn signed_quadratic_features(features: &[f64]) -> Vec<f64> {
    let mut out = features.to_vec();
    for i in 0..features.len() {
        for j in i..features.len() {
            let term = features[i] * features[j];
            if i == j && features[i] < 0.0 {
                out.push(-term);
            } else {
                out.push(term);
            }
        }
    }
    out
}

/// 切片付き最小二乗回帰の即時フィットと予測
///
/// 展開済み特徴量に切片列を加えた計画行列をSVDで解き、同一の展開を
/// 適用した問い合わせ点の予測値を返します。行が無い場合や分解に
/// 失敗した場合はNoneです。同一入力に対して常に同一の結果を返します。
fn ols_predict(
    rows: &[&Vec<f64>],
    expand: &dyn Fn(&[f64]) -> Vec<f64>,
    query: &[f64],
) -> Option<f64> {
    if rows.is_empty() {
        return None;
    }

    let expanded_query = expand(query);
    let ncols = expanded_query.len() + 1; // 切片列を先頭に追加
    let nrows = rows.len();

    let mut a_mat = DMatrix::<f64>::zeros(nrows, ncols);
    let mut b_vec = DVector::<f64>::zeros(nrows);

    for (r, row) in rows.iter().enumerate() {
        let expanded = expand(CalibrationTable::features_of(row));
        if expanded.len() + 1 != ncols {
            return None;
        }
        a_mat[(r, 0)] = 1.0;
        for (c, value) in expanded.iter().enumerate() {
            a_mat[(r, c + 1)] = *value;
        }
        b_vec[r] = CalibrationTable::target_of(row);
    }

    let svd = a_mat.svd(true, true);
    let coeffs = svd.solve(&b_vec, 1e-12).ok()?;

    let mut prediction = coeffs[0];
    for (c, value) in expanded_query.iter().enumerate() {
        prediction += coeffs[c + 1] * value;
    }
    prediction.is_finite().then_some(prediction)
}

/// 較正ストアの読み書きエラー
#[derive(Debug)]
pub enum CalibrationIoError {
    FileNotFound(PathBuf),
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for CalibrationIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalibrationIoError::FileNotFound(path) => {
                write!(f, "較正データファイルが見つかりません: {}", path.display())
            }
            CalibrationIoError::IoError(path, err) => {
                write!(f, "較正データ読み書きエラー {}: {}", path.display(), err)
            }
            CalibrationIoError::ParseError(path, err) => {
                write!(f, "較正データ解析エラー {}: {}", path.display(), err)
            }
        }
    }
}

impl std::error::Error for CalibrationIoError {}
