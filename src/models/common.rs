use std::ops::{Add, Mul, Sub};

/// 3次元ベクトルを表す構造体（位置・速度の両方に使用）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f64, // m
    pub y: f64, // m (altitude)
    pub z: f64, // m
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// ベクトルの長さ（原点からの距離）
    pub fn magnitude(&self) -> f64 {
        (self.x.powi(2) + self.y.powi(2) + self.z.powi(2)).sqrt()
    }

    /// XZ平面での長さ（高度差を無視した水平距離）
    pub fn flat_magnitude(&self) -> f64 {
        (self.x.powi(2) + self.z.powi(2)).sqrt()
    }

    /// 3次元距離を計算
    pub fn distance(&self, other: &Vec3) -> f64 {
        (*self - *other).magnitude()
    }

    /// XZ平面での水平距離を計算
    pub fn flat_distance(&self, other: &Vec3) -> f64 {
        (*self - *other).flat_magnitude()
    }

    /// 内積
    pub fn dot(&self, other: &Vec3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// ベクトルを正規化
    pub fn normalize(&self) -> Self {
        let mag = self.magnitude();
        if mag > 0.0 {
            Self::new(self.x / mag, self.y / mag, self.z / mag)
        } else {
            *self
        }
    }

    /// 全成分が有限値かどうかを判定
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Vec3 {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;

    fn sub(self, other: Self) -> Self::Output {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Self;

    fn mul(self, scalar: f64) -> Self::Output {
        Self::new(self.x * scalar, self.y * scalar, self.z * scalar)
    }
}

/// 数学ユーティリティ関数
pub mod math_utils {
    use super::Vec3;

    /// 度をラジアンに変換
    pub fn deg_to_rad(degrees: f64) -> f64 {
        degrees * std::f64::consts::PI / 180.0
    }

    /// ラジアンを度に変換
    pub fn rad_to_deg(radians: f64) -> f64 {
        radians * 180.0 / std::f64::consts::PI
    }

    /// 角度を(-180, 180]度の範囲に正規化
    pub fn normalize_angle(angle_deg: f64) -> f64 {
        let mut normalized = angle_deg % 360.0;
        if normalized > 180.0 {
            normalized -= 360.0;
        } else if normalized <= -180.0 {
            normalized += 360.0;
        }
        normalized
    }

    /// 2つの角度の差を計算（(-180, 180]度の範囲）
    pub fn angle_difference(angle1_deg: f64, angle2_deg: f64) -> f64 {
        normalize_angle(angle2_deg - angle1_deg)
    }

    /// 自身からターゲットへの水平方位角を計算（度）
    ///
    /// ヨー角0度が+Z方向、正回転が-X方向というホスト側の規約に従います。
    pub fn bearing_deg(origin_x: f64, origin_z: f64, target_x: f64, target_z: f64) -> f64 {
        rad_to_deg((origin_x - target_x).atan2(target_z - origin_z))
    }

    /// ヨー角から水平単位方向ベクトルを生成
    ///
    /// `bearing_deg`と同じ規約: yaw=0 → (0,0,1)、yaw=90 → (-1,0,0)。
    pub fn vector_from_yaw(yaw_deg: f64) -> Vec3 {
        let rad = deg_to_rad(yaw_deg);
        Vec3::new(-rad.sin(), 0.0, rad.cos())
    }

    /// 2つのベクトルのなす角を計算（度）
    ///
    /// いずれかがゼロベクトルの場合は数値エラーを伝播せず0度を返します。
    pub fn angle_between(v1: &Vec3, v2: &Vec3) -> f64 {
        let mag1 = v1.magnitude();
        let mag2 = v2.magnitude();
        if mag1 == 0.0 || mag2 == 0.0 {
            return 0.0;
        }
        let cos = (v1.dot(v2) / (mag1 * mag2)).clamp(-1.0, 1.0);
        rad_to_deg(cos.acos())
    }

    /// ベクトルを基準ベクトルへ射影
    pub fn project_vector(v: &Vec3, basis: &Vec3) -> Vec3 {
        let mag_sq = basis.dot(basis);
        if mag_sq == 0.0 {
            return Vec3::default();
        }
        *basis * (v.dot(basis) / mag_sq)
    }

    /// 基準方向への符号付き射影量を計算
    ///
    /// 射影の大きさに、射影と基準方向のなす角の余弦の符号を与えます。
    /// 基準方向と逆向きの射影は負の値になります。
    pub fn signed_projection(v: &Vec3, basis: &Vec3) -> f64 {
        let projected = project_vector(v, basis);
        let cos = deg_to_rad(angle_between(basis, &projected)).cos();
        projected.magnitude().copysign(cos)
    }
}

#[cfg(test)]
mod tests {
    use super::math_utils::*;
    use super::*;

    #[test]
    fn test_normalize_angle_range() {
        assert_eq!(normalize_angle(190.0), -170.0);
        assert_eq!(normalize_angle(-190.0), 170.0);
        assert_eq!(normalize_angle(180.0), 180.0);
        assert_eq!(normalize_angle(-180.0), 180.0);
        assert_eq!(normalize_angle(540.0), 180.0);
    }

    #[test]
    fn test_normalize_angle_idempotent() {
        for i in -720..=720 {
            let angle = i as f64 * 0.5;
            let once = normalize_angle(angle);
            assert_eq!(normalize_angle(once), once);
        }
    }

    #[test]
    fn test_angle_between_zero_vector() {
        let zero = Vec3::default();
        let unit = Vec3::new(0.0, 0.0, 1.0);
        assert_eq!(angle_between(&zero, &unit), 0.0);
        assert_eq!(angle_between(&unit, &zero), 0.0);
    }

    #[test]
    fn test_vector_from_yaw_convention() {
        let forward = vector_from_yaw(0.0);
        assert!((forward.z - 1.0).abs() < 1e-12);
        assert!(forward.x.abs() < 1e-12);

        let left = vector_from_yaw(90.0);
        assert!((left.x + 1.0).abs() < 1e-12);
        assert!(left.z.abs() < 1e-12);
    }

    #[test]
    fn test_signed_projection_opposite_direction() {
        let basis = Vec3::new(0.0, 0.0, 1.0);
        let toward = Vec3::new(0.0, 0.0, 3.0);
        let away = Vec3::new(0.0, 0.0, -3.0);
        assert!((signed_projection(&toward, &basis) - 3.0).abs() < 1e-12);
        assert!((signed_projection(&away, &basis) + 3.0).abs() < 1e-12);
        assert_eq!(signed_projection(&Vec3::default(), &basis), 0.0);
    }

    #[test]
    fn test_flat_distance_ignores_altitude() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(3.0, 100.0, 4.0);
        assert!((a.flat_distance(&b) - 5.0).abs() < 1e-12);
    }
}
