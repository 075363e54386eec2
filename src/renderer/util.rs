use glam::{Mat4, Vec2, Vec3, Vec4};
use crate::renderer::backend::Extent2D;

/// Right-handed perspective with y pointing down in clip space
pub fn perspective(fov_y_deg: f32, extent: Extent2D, depth_range: [f32; 2]) -> Mat4 {
    let aspect = extent.width.max(1) as f32 / extent.height.max(1) as f32;
    let mut proj = Mat4::perspective_rh(fov_y_deg.to_radians(), aspect, depth_range[0], depth_range[1]);
    proj.y_axis.y *= -1.0;
    proj
}

/// Orthographic projection with the origin at the top left, `scale` units per pixel
pub fn orthographic(extent: Extent2D, scale: f32, depth_range: [f32; 2]) -> Mat4 {
    Mat4::orthographic_rh(
        0.0,
        extent.width as f32 * scale,
        0.0,
        extent.height as f32 * scale,
        depth_range[0],
        depth_range[1],
    )
}

/// Maps the full-screen triangle onto the largest area of `window` that keeps
/// the aspect ratio of `target`. The rest of the window shows the border colour.
pub fn letterbox_transform(target: Extent2D, window: Extent2D) -> Mat4 {
    if target.is_zero() || window.is_zero() {
        return Mat4::IDENTITY;
    }
    let (tw, th) = (target.width as f32, target.height as f32);
    let (ww, wh) = (window.width as f32, window.height as f32);
    let scale = (ww / tw).min(wh / th);
    Mat4::from_scale(Vec3::new(tw * scale / ww, th * scale / wh, 1.0))
}

/// Model matrix of a 2D rect `(x, y, width, height)` rotated by `rotate` degrees around its centre
pub fn rect_matrix(rect: Vec4, rotate: f32, depth: f32) -> Mat4 {
    let mut model = Mat4::from_translation(Vec3::new(rect.x, rect.y, depth));
    if rotate != 0.0 {
        let half = Vec3::new(0.5 * rect.z, 0.5 * rect.w, 0.0);
        model = model
            * Mat4::from_translation(half)
            * Mat4::from_rotation_z(rotate.to_radians())
            * Mat4::from_translation(-half);
    }
    model * Mat4::from_scale(Vec3::new(rect.z, rect.w, 1.0))
}

/// Uv offset and scale sampling the pixel `region` of a texture of `size`
pub fn texture_region(size: Vec2, region: Vec4) -> Vec4 {
    if size.x <= 0.0 || size.y <= 0.0 {
        return Vec4::new(0.0, 0.0, 1.0, 1.0);
    }
    Vec4::new(region.x / size.x, region.y / size.y, region.z / size.x, region.w / size.y)
}

/// Transposed inverse of the upper 3x3, for transforming normals
pub fn normal_matrix(model: Mat4) -> Mat4 {
    let det = model.determinant();
    if det.abs() <= f32::EPSILON {
        return Mat4::IDENTITY;
    }
    model.inverse().transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn letterbox_pillarboxes_wide_windows() {
        let t = letterbox_transform(Extent2D::new(400, 300), Extent2D::new(800, 300));
        assert_relative_eq!(t.x_axis.x, 0.5);
        assert_relative_eq!(t.y_axis.y, 1.0);
    }

    #[test]
    fn letterbox_is_identity_for_matching_aspect() {
        let t = letterbox_transform(Extent2D::new(320, 180), Extent2D::new(1280, 720));
        assert_relative_eq!(t.x_axis.x, 1.0);
        assert_relative_eq!(t.y_axis.y, 1.0);
    }

    #[test]
    fn rect_matrix_maps_the_unit_quad_onto_the_rect() {
        let m = rect_matrix(Vec4::new(10.0, 20.0, 4.0, 2.0), 0.0, 1.0);
        let corner = m.transform_point3(Vec3::new(1.0, 1.0, 0.0));
        assert_relative_eq!(corner.x, 14.0);
        assert_relative_eq!(corner.y, 22.0);
        assert_relative_eq!(corner.z, 1.0);
    }

    #[test]
    fn rotation_is_about_the_centre() {
        let m = rect_matrix(Vec4::new(0.0, 0.0, 2.0, 2.0), 180.0, 0.0);
        let centre = m.transform_point3(Vec3::new(0.5, 0.5, 0.0));
        assert_relative_eq!(centre.x, 1.0, epsilon = 1e-5);
        assert_relative_eq!(centre.y, 1.0, epsilon = 1e-5);
        let origin = m.transform_point3(Vec3::ZERO);
        assert_relative_eq!(origin.x, 2.0, epsilon = 1e-5);
    }

    #[test]
    fn perspective_flips_y() {
        let flipped = perspective(45.0, Extent2D::new(100, 100), [0.1, 100.0]);
        let regular = Mat4::perspective_rh(45f32.to_radians(), 1.0, 0.1, 100.0);
        assert_relative_eq!(flipped.y_axis.y, -regular.y_axis.y);
    }

    #[test]
    fn texture_region_is_normalised() {
        let r = texture_region(Vec2::new(64.0, 32.0), Vec4::new(16.0, 8.0, 32.0, 16.0));
        assert_eq!(r, Vec4::new(0.25, 0.25, 0.5, 0.5));
    }
}
