//! Skeletal animation evaluated on the CPU and uploaded as bone matrices.

use glam::{Mat4, Quat, Vec3};
use crate::renderer::shader_data::MAX_BONES;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointTransform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for JointTransform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl JointTransform {
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Joint {
    pub name: String,
    pub parent: Option<usize>,
    pub inverse_bind: Mat4,
    pub rest: JointTransform,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Skeleton {
    joints: Vec<Joint>,
    /// Transform of the nodes above the root joints
    root: Mat4,
    /// Joint indices with every parent before its children
    order: Vec<usize>,
}

impl Skeleton {
    pub fn new(joints: Vec<Joint>, root: Mat4) -> Self {
        let mut order = Vec::with_capacity(joints.len());
        let mut placed = vec![false; joints.len()];
        while order.len() < joints.len() {
            let before = order.len();
            for (i, joint) in joints.iter().enumerate() {
                if placed[i] {
                    continue;
                }
                let ready = match joint.parent {
                    Some(parent) => parent >= joints.len() || placed[parent],
                    None => true,
                };
                if ready {
                    placed[i] = true;
                    order.push(i);
                }
            }
            if order.len() == before {
                // cycle in the hierarchy, treat the rest as roots
                log::warn!("skeleton joint hierarchy contains a cycle");
                order.extend((0..joints.len()).filter(|&i| !placed[i]));
                break;
            }
        }
        if joints.len() > MAX_BONES {
            log::warn!(
                "skeleton has {} joints, only the first {} are animated",
                joints.len(),
                MAX_BONES
            );
        }
        Self { joints, root, order }
    }

    pub fn joints(&self) -> &[Joint] {
        &self.joints
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelValues {
    Translation(Vec<Vec3>),
    Rotation(Vec<Quat>),
    Scale(Vec<Vec3>),
}

/// Keyframes of one joint property
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub joint: usize,
    pub times: Vec<f32>,
    pub values: ChannelValues,
    pub step: bool,
}

impl Channel {
    /// Returns the keyframe pair around `time` and the blend factor between them
    fn sample_points(&self, time: f32) -> Option<(usize, usize, f32)> {
        let last = self.times.len().checked_sub(1)?;
        if time <= self.times[0] {
            return Some((0, 0, 0.0));
        }
        if time >= self.times[last] {
            return Some((last, last, 0.0));
        }
        let next = self.times.partition_point(|&t| t <= time);
        let prev = next - 1;
        let span = self.times[next] - self.times[prev];
        if self.step || span <= f32::EPSILON {
            return Some((prev, prev, 0.0));
        }
        Some((prev, next, (time - self.times[prev]) / span))
    }

    fn apply(&self, time: f32, pose: &mut JointTransform) {
        let Some((a, b, t)) = self.sample_points(time) else {
            return;
        };
        match &self.values {
            ChannelValues::Translation(v) if b < v.len() => {
                pose.translation = v[a].lerp(v[b], t);
            }
            ChannelValues::Rotation(v) if b < v.len() => {
                pose.rotation = v[a].slerp(v[b], t).normalize();
            }
            ChannelValues::Scale(v) if b < v.len() => {
                pose.scale = v[a].lerp(v[b], t);
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnimationClip {
    pub name: String,
    pub channels: Vec<Channel>,
}

impl AnimationClip {
    pub fn duration(&self) -> f32 {
        self.channels
            .iter()
            .filter_map(|c| c.times.last().copied())
            .fold(0.0, f32::max)
    }
}

/// One clip bound to a skeleton, with the pose of the last `update`
#[derive(Debug, Clone)]
pub struct ModelAnimation {
    skeleton: Skeleton,
    clip: AnimationClip,
    duration: f32,
    bones: Vec<Mat4>,
}

impl ModelAnimation {
    pub fn new(skeleton: Skeleton, clip: AnimationClip) -> Self {
        let duration = clip.duration();
        let mut animation = Self {
            bones: vec![Mat4::IDENTITY; skeleton.len().min(MAX_BONES)],
            skeleton,
            clip,
            duration,
        };
        animation.update(0.0);
        animation
    }

    pub fn name(&self) -> &str {
        &self.clip.name
    }

    /// Length of the clip in seconds
    pub fn duration(&self) -> f32 {
        self.duration
    }

    /// Evaluates the pose at `time` seconds. The clip loops.
    pub fn update(&mut self, time: f32) {
        let time = if self.duration > 0.0 {
            time.rem_euclid(self.duration)
        } else {
            0.0
        };

        let joints = self.skeleton.joints();
        let mut poses: Vec<JointTransform> = joints.iter().map(|j| j.rest).collect();
        for channel in &self.clip.channels {
            if let Some(pose) = poses.get_mut(channel.joint) {
                channel.apply(time, pose);
            }
        }

        let mut globals = vec![Mat4::IDENTITY; joints.len()];
        for &i in &self.skeleton.order {
            let parent = joints[i]
                .parent
                .filter(|&p| p < joints.len())
                .map_or(self.skeleton.root, |p| globals[p]);
            globals[i] = parent * poses[i].matrix();
        }

        for (i, bone) in self.bones.iter_mut().enumerate() {
            *bone = globals[i] * joints[i].inverse_bind;
        }
    }

    /// Joint matrices of the current pose, at most `MAX_BONES`
    pub fn current_bones(&self) -> &[Mat4] {
        &self.bones
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn two_joint_skeleton() -> Skeleton {
        Skeleton::new(
            vec![
                Joint {
                    name: "child".into(),
                    parent: Some(1),
                    inverse_bind: Mat4::from_translation(Vec3::new(0.0, -1.0, 0.0)),
                    rest: JointTransform {
                        translation: Vec3::new(0.0, 1.0, 0.0),
                        ..Default::default()
                    },
                },
                Joint {
                    name: "root".into(),
                    parent: None,
                    inverse_bind: Mat4::IDENTITY,
                    rest: JointTransform::default(),
                },
            ],
            Mat4::IDENTITY,
        )
    }

    fn slide_clip() -> AnimationClip {
        AnimationClip {
            name: "slide".into(),
            channels: vec![Channel {
                joint: 1,
                times: vec![0.0, 2.0],
                values: ChannelValues::Translation(vec![Vec3::ZERO, Vec3::new(4.0, 0.0, 0.0)]),
                step: false,
            }],
        }
    }

    #[test]
    fn rest_pose_gives_identity_bones() {
        let animation = ModelAnimation::new(
            two_joint_skeleton(),
            AnimationClip { name: "idle".into(), channels: vec![] },
        );
        for bone in animation.current_bones() {
            assert_relative_eq!(bone.to_cols_array()[..], Mat4::IDENTITY.to_cols_array()[..]);
        }
    }

    #[test]
    fn parents_are_applied_before_children() {
        let mut animation = ModelAnimation::new(two_joint_skeleton(), slide_clip());
        animation.update(1.0);
        let child = animation.current_bones()[0];
        let moved = child.transform_point3(Vec3::new(0.0, 1.0, 0.0));
        assert_relative_eq!(moved.x, 2.0, epsilon = 1e-5);
        assert_relative_eq!(moved.y, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn clip_loops_over_its_duration() {
        let mut animation = ModelAnimation::new(two_joint_skeleton(), slide_clip());
        assert_relative_eq!(animation.duration(), 2.0);
        animation.update(2.5);
        let looped = animation.current_bones()[1];
        animation.update(0.5);
        let direct = animation.current_bones()[1];
        assert_relative_eq!(looped.to_cols_array()[..], direct.to_cols_array()[..], epsilon = 1e-5);
    }

    #[test]
    fn rotation_channels_slerp() {
        let channel = Channel {
            joint: 0,
            times: vec![0.0, 1.0],
            values: ChannelValues::Rotation(vec![
                Quat::IDENTITY,
                Quat::from_rotation_z(std::f32::consts::FRAC_PI_2),
            ]),
            step: false,
        };
        let mut pose = JointTransform::default();
        channel.apply(0.5, &mut pose);
        let (_, angle) = pose.rotation.to_axis_angle();
        assert_relative_eq!(angle, std::f32::consts::FRAC_PI_4, epsilon = 1e-5);
    }
}
