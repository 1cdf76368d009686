use bytemuck::{Pod, Zeroable};

/// Column-major 4x4 float matrix, laid out the way GLSL `mat4` expects.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Mat4(pub [f32; 16]);

impl Default for Mat4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mat4 {
    pub const IDENTITY: Mat4 = Mat4([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]);

    pub fn translation(x: f32, y: f32) -> Self {
        let mut m = Self::IDENTITY;
        m.0[12] = x;
        m.0[13] = y;
        m
    }

    pub fn scale(x: f32, y: f32) -> Self {
        let mut m = Self::IDENTITY;
        m.0[0] = x;
        m.0[5] = y;
        m
    }

    /// Counter-clockwise rotation about the z axis.
    pub fn rotation_z(degrees: f32) -> Self {
        let (sin, cos) = degrees.to_radians().sin_cos();
        let mut m = Self::IDENTITY;
        m.0[0] = cos;
        m.0[1] = sin;
        m.0[4] = -sin;
        m.0[5] = cos;
        m
    }

    /// A flip of texture space around `v = 0.5`.
    pub fn vertical_flip() -> Self {
        Self::IDENTITY.pre_vertical_flip(0.5)
    }

    /// Returns `self * rhs`.
    pub fn multiply(&self, rhs: &Mat4) -> Mat4 {
        let a = &self.0;
        let b = &rhs.0;
        let mut out = [0.0f32; 16];
        for col in 0..4 {
            for row in 0..4 {
                out[col * 4 + row] = (0..4).map(|k| a[k * 4 + row] * b[col * 4 + k]).sum();
            }
        }
        Mat4(out)
    }

    /// Applies a rotation around `(pivot_x, pivot_y)` before this transform.
    pub fn pre_rotate(&self, degrees: f32, pivot_x: f32, pivot_y: f32) -> Mat4 {
        self.multiply(&Mat4::translation(pivot_x, pivot_y))
            .multiply(&Mat4::rotation_z(degrees))
            .multiply(&Mat4::translation(-pivot_x, -pivot_y))
    }

    /// Applies a vertical mirror around `y` before this transform.
    pub fn pre_vertical_flip(&self, y: f32) -> Mat4 {
        self.multiply(&Mat4::translation(0.0, y))
            .multiply(&Mat4::scale(1.0, -1.0))
            .multiply(&Mat4::translation(0.0, -y))
    }

    pub fn transform_point(&self, x: f32, y: f32) -> (f32, f32) {
        let m = &self.0;
        (
            m[0] * x + m[4] * y + m[12],
            m[1] * x + m[5] * y + m[13],
        )
    }
}
