//! Firefly swarm effect
//!
//! A fixed pool of particles drifts under gravity and an oscillating wind.
//! Claimed particles are additionally pulled toward the landmark they were
//! assigned, mirrored around the screen center, and grow while they cling to
//! it. Particles that fall off the bottom or right edge re-enter from the top
//! or from the side the wind is currently blowing from.

use bytemuck::{Pod, Zeroable};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::landmarks::LandmarkFrame;

/// Shared sway/wind phase advance per tick
const ANGLE_STEP: f32 = 0.01;

/// X coordinate for particles entering from the left edge, just off screen
const LEFT_ENTRY_X: f32 = -5.0;

/// Share of boundary resets that respawn along the top edge
const TOP_RESPAWN_PROBABILITY: f64 = 0.6;

/// One particle (48 bytes; uploaded as-is to the GPU instance buffer)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Particle {
    /// Position in screen-space pixels
    pub pos: [f32; 2],
    /// Current radius
    pub size: f32,
    /// Upper bound for growth while claimed, randomized per spawn
    pub max_size: f32,
    /// Fill color (RGBA); alpha randomized at spawn
    pub color: [f32; 4],
    /// Nonzero while the particle is drawn toward its landmark
    pub claimed: u32,
    /// Index into the tracked-objects list
    pub target_object: u32,
    /// Index into that object's landmark list
    pub target_landmark: u32,
    pub _pad: u32,
}

/// Steering law for claimed particles.
///
/// The two variants behave similarly (damped approach to the landmark);
/// `Nudge` steps a fixed distance along the normalized direction and can
/// oscillate near the target, `Smoothing` interpolates and cannot overshoot.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "law", rename_all = "snake_case")]
pub enum SteeringLaw {
    Nudge {
        /// Step magnitude in pixels per tick
        factor: f32,
        /// Upper bound for a per-tick random scale; 0 disables the jitter
        jitter: f32,
    },
    Smoothing {
        /// Interpolation factor per tick, applied independently to X and Y
        factor: f32,
    },
}

impl Default for SteeringLaw {
    fn default() -> Self {
        Self::Smoothing { factor: 0.03 }
    }
}

/// Tunable physics parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FireflyParams {
    /// Smallest radius a particle can have
    pub min_size: f32,
    /// Upper bound for the radius assigned at spawn and reset
    pub max_natural_size: f32,
    /// Upper bound for `max_size`, the growth limit while claimed
    pub max_grown_size: f32,
    /// Chance a particle is claimed at spawn (and at reset re-rolls)
    pub claimed_probability: f64,
    /// Horizontal sway amplitude
    pub wind_scale: f32,
    /// Scales the downward drift; 0 disables drift entirely
    pub drift_scale: f32,
    /// Radius gained per tick while claimed and clinging to a landmark
    pub growth_step: f32,
    pub steering: SteeringLaw,
    /// Per-tick chance a claimed particle escapes back to free drifting
    pub escape_probability: f64,
    /// Chance to re-roll the claimed status at boundary reset; 0 disables
    pub reflip_probability: f64,
    /// Unconditional per-tick reset chance, independent of position
    pub random_reset_probability: f64,
}

impl Default for FireflyParams {
    fn default() -> Self {
        Self {
            min_size: 1.0,
            max_natural_size: 7.0,
            max_grown_size: 50.0,
            claimed_probability: 0.5,
            wind_scale: 3.0,
            drift_scale: 1.0,
            growth_step: 0.5,
            steering: SteeringLaw::default(),
            escape_probability: 0.001,
            reflip_probability: 0.25,
            random_reset_probability: 0.001,
        }
    }
}

/// Firefly swarm runtime: the particle pool plus per-tick simulation state
pub struct FireflySwarm {
    particles: Vec<Particle>,
    params: FireflyParams,
    /// Valid landmark indices are `0..landmark_count`
    landmark_count: u32,
    /// Sway phase, advanced once per tick (not per particle)
    angle: f32,
    rng: StdRng,
}

impl FireflySwarm {
    /// Allocate the particle pool with randomized initial state.
    ///
    /// `seed` pins the random source for reproducible runs; `None` seeds from
    /// the OS.
    pub fn new(
        count: usize,
        bounds: (f32, f32),
        params: FireflyParams,
        max_tracked: u32,
        landmark_count: u32,
        seed: Option<u64>,
    ) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let particles = (0..count)
            .map(|_| spawn(&mut rng, bounds, &params, max_tracked, landmark_count))
            .collect();

        Self {
            particles,
            params,
            landmark_count,
            angle: 0.0,
            rng,
        }
    }

    /// Advance the whole pool by one simulation tick against the given
    /// landmark frame. `bounds` is the current canvas size in pixels.
    pub fn step(&mut self, frame: &LandmarkFrame, bounds: (f32, f32)) {
        self.angle += ANGLE_STEP;
        let angle = self.angle;
        let params = &self.params;
        let landmark_count = self.landmark_count;
        let rng = &mut self.rng;

        for particle in &mut self.particles {
            drift(particle, angle, params);
            seek(particle, frame, bounds, params, rng);
            reset_if_out_of_bounds(particle, angle, bounds, params, landmark_count, rng);
        }
    }

    /// Re-roll every particle's landmark assignment, e.g. after switching to
    /// a model with a different point count
    pub fn retarget(&mut self, landmark_count: u32) {
        self.landmark_count = landmark_count;
        for particle in &mut self.particles {
            particle.target_landmark = self.rng.random_range(0..landmark_count);
        }
    }

    /// Particles for rendering
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn particle_count(&self) -> usize {
        self.particles.len()
    }

    pub fn params(&self) -> &FireflyParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut FireflyParams {
        &mut self.params
    }

    pub fn landmark_count(&self) -> u32 {
        self.landmark_count
    }
}

/// Produce one particle with randomized state within the configured ranges
fn spawn(
    rng: &mut StdRng,
    bounds: (f32, f32),
    params: &FireflyParams,
    max_tracked: u32,
    landmark_count: u32,
) -> Particle {
    let max_size = rng.random_range(params.min_size..=params.max_grown_size);
    // The growth bound can land below the natural size range; clamp so
    // size <= max_size holds from the first tick.
    let size = rng
        .random_range(params.min_size..=params.max_natural_size)
        .min(max_size);

    Particle {
        pos: [
            rng.random_range(0.0..bounds.0),
            rng.random_range(0.0..bounds.1),
        ],
        size,
        max_size,
        color: [1.0, 1.0, 1.0, rng.random::<f32>()],
        claimed: rng.random_bool(params.claimed_probability) as u32,
        target_object: rng.random_range(0..max_tracked),
        target_landmark: rng.random_range(0..landmark_count),
        _pad: 0,
    }
}

/// Gravity plus wind. The fall rate is phase-shifted by the particle's own
/// size so the pool doesn't fall in lockstep; the sideways sway follows the
/// shared angle.
fn drift(particle: &mut Particle, angle: f32, params: &FireflyParams) {
    particle.pos[1] += ((angle + particle.size).cos() + 1.0) * params.drift_scale;
    particle.pos[0] += angle.sin() * params.wind_scale;
}

/// Pull a claimed particle toward its assigned landmark, mirrored around the
/// screen center. A target object missing from this frame means no steering
/// this tick; the particle keeps drifting.
fn seek(
    particle: &mut Particle,
    frame: &LandmarkFrame,
    bounds: (f32, f32),
    params: &FireflyParams,
    rng: &mut StdRng,
) {
    if particle.claimed == 0 {
        return;
    }

    let target = frame
        .objects
        .get(particle.target_object as usize)
        .and_then(|object| object.points.get(particle.target_landmark as usize));

    if let Some(point) = target {
        let dest = point.to_screen(bounds.0, bounds.1);

        match params.steering {
            SteeringLaw::Nudge { factor, jitter } => {
                let dx = dest[0] - particle.pos[0];
                let dy = dest[1] - particle.pos[1];
                let distance = (dx * dx + dy * dy).sqrt();
                // A particle sitting exactly on the landmark stays put.
                if distance > 0.0 {
                    let step = if jitter > 0.0 {
                        factor * rng.random_range(0.0..jitter)
                    } else {
                        factor
                    };
                    particle.pos[0] += dx / distance * step;
                    particle.pos[1] += dy / distance * step;
                }
            }
            SteeringLaw::Smoothing { factor } => {
                particle.pos[0] += factor * (dest[0] - particle.pos[0]);
                particle.pos[1] += factor * (dest[1] - particle.pos[1]);
            }
        }

        if particle.size < particle.max_size {
            particle.size = (particle.size + params.growth_step).min(particle.max_size);
        }
    }

    if rng.random_bool(params.escape_probability) {
        particle.claimed = 0;
    }
}

/// Respawn a particle that left the visible area past the bottom or right
/// edge (or hit the unconditional reset chance): usually along the top edge,
/// otherwise entering from the side the wind is blowing from.
fn reset_if_out_of_bounds(
    particle: &mut Particle,
    angle: f32,
    bounds: (f32, f32),
    params: &FireflyParams,
    landmark_count: u32,
    rng: &mut StdRng,
) {
    let (max_x, max_y) = bounds;
    let out = particle.pos[1] > max_y || particle.pos[0] > max_x;
    if !out && !rng.random_bool(params.random_reset_probability) {
        return;
    }

    if rng.random_bool(TOP_RESPAWN_PROBABILITY) {
        particle.pos = [rng.random_range(0.0..max_x), 0.0];
    } else {
        let x = if angle.sin() > 0.0 { LEFT_ENTRY_X } else { max_x };
        particle.pos = [x, rng.random_range(0.0..max_y)];
    }

    particle.size = rng
        .random_range(params.min_size..=params.max_natural_size)
        .min(particle.max_size);
    particle.target_landmark = rng.random_range(0..landmark_count);

    if params.reflip_probability > 0.0 && rng.random_bool(params.reflip_probability) {
        particle.claimed = rng.random_bool(params.claimed_probability) as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::{LandmarkPoint, TrackedObject};

    const BOUNDS: (f32, f32) = (800.0, 600.0);
    const HAND_LANDMARKS: u32 = 21;

    /// Params with every probabilistic branch disabled, for deterministic
    /// position checks
    fn quiet_params() -> FireflyParams {
        FireflyParams {
            escape_probability: 0.0,
            reflip_probability: 0.0,
            random_reset_probability: 0.0,
            ..FireflyParams::default()
        }
    }

    /// One tracked object whose landmarks all sit at the same normalized point
    fn frame_with_point(x: f32, y: f32) -> LandmarkFrame {
        LandmarkFrame {
            objects: vec![TrackedObject {
                points: vec![LandmarkPoint { x, y, z: 0.0 }; HAND_LANDMARKS as usize],
            }],
            frame_number: 1,
        }
    }

    fn swarm(count: usize, params: FireflyParams, seed: u64) -> FireflySwarm {
        FireflySwarm::new(count, BOUNDS, params, 2, HAND_LANDMARKS, Some(seed))
    }

    #[test]
    fn test_size_stays_within_bounds() {
        let mut swarm = swarm(200, FireflyParams::default(), 7);
        let frame = frame_with_point(0.5, 0.5);

        for _ in 0..500 {
            swarm.step(&frame, BOUNDS);
            for p in swarm.particles() {
                assert!(p.size >= swarm.params().min_size, "size fell below minimum");
                assert!(p.size <= p.max_size, "size exceeded its growth bound");
            }
        }
    }

    #[test]
    fn test_boundary_reset_lands_on_entry_edges() {
        let mut swarm = swarm(100, quiet_params(), 11);
        for p in &mut swarm.particles {
            p.pos = [5000.0, 5000.0];
        }

        swarm.step(&LandmarkFrame::default(), BOUNDS);

        for p in swarm.particles() {
            let on_top = p.pos[1] == 0.0 && p.pos[0] >= 0.0 && p.pos[0] < BOUNDS.0;
            let on_side = (p.pos[0] == LEFT_ENTRY_X || p.pos[0] == BOUNDS.0)
                && p.pos[1] >= 0.0
                && p.pos[1] < BOUNDS.1;
            assert!(on_top || on_side, "reset landed at {:?}", p.pos);
            assert!(p.target_landmark < HAND_LANDMARKS);
        }
    }

    #[test]
    fn test_empty_frame_never_seeks() {
        // All claimed, drift disabled: with nothing to seek, nothing moves.
        let params = FireflyParams {
            claimed_probability: 1.0,
            drift_scale: 0.0,
            wind_scale: 0.0,
            ..quiet_params()
        };
        let mut swarm = swarm(100, params, 3);
        let before: Vec<Particle> = swarm.particles().to_vec();

        for _ in 0..50 {
            swarm.step(&LandmarkFrame::default(), BOUNDS);
        }

        for (p, q) in swarm.particles().iter().zip(&before) {
            assert_eq!(p.pos, q.pos);
        }
    }

    #[test]
    fn test_seeded_runs_are_identical() {
        let mut a = swarm(150, FireflyParams::default(), 42);
        let mut b = swarm(150, FireflyParams::default(), 42);
        let frames = [
            frame_with_point(0.2, 0.3),
            frame_with_point(0.8, 0.6),
            LandmarkFrame::default(),
        ];

        for tick in 0..300 {
            let frame = &frames[tick % frames.len()];
            a.step(frame, BOUNDS);
            b.step(frame, BOUNDS);
        }

        assert_eq!(a.particles(), b.particles());
    }

    #[test]
    fn test_zero_distance_produces_no_nan() {
        for steering in [
            SteeringLaw::Nudge {
                factor: 10.0,
                jitter: 0.0,
            },
            SteeringLaw::Smoothing { factor: 0.03 },
        ] {
            let params = FireflyParams {
                claimed_probability: 1.0,
                drift_scale: 0.0,
                wind_scale: 0.0,
                steering,
                ..quiet_params()
            };
            let mut swarm = swarm(10, params, 9);
            // Park every particle exactly on the mirrored destination of
            // (0.25, 0.4): (800 - 200, 240).
            for p in &mut swarm.particles {
                p.pos = [600.0, 240.0];
                p.target_object = 0;
            }

            swarm.step(&frame_with_point(0.25, 0.4), BOUNDS);

            for p in swarm.particles() {
                assert!(p.pos[0].is_finite() && p.pos[1].is_finite());
                assert!(p.size.is_finite());
                assert_eq!(p.pos, [600.0, 240.0]);
            }
        }
    }

    #[test]
    fn test_smoothing_converges_without_overshoot() {
        let params = FireflyParams {
            claimed_probability: 1.0,
            drift_scale: 0.0,
            wind_scale: 0.0,
            steering: SteeringLaw::Smoothing { factor: 0.03 },
            ..quiet_params()
        };
        let mut swarm = swarm(100, params, 5);
        for p in &mut swarm.particles {
            p.target_object = 0;
        }

        // One object fixed at the screen center; mirrored destination is
        // (800 - 400, 300).
        let frame = frame_with_point(0.5, 0.5);
        let dest = [400.0f32, 300.0f32];

        let mut distances: Vec<f32> = swarm
            .particles()
            .iter()
            .map(|p| (p.pos[0] - dest[0]).hypot(p.pos[1] - dest[1]))
            .collect();

        for _ in 0..400 {
            swarm.step(&frame, BOUNDS);
            for (p, prev) in swarm.particles().iter().zip(&mut distances) {
                let d = (p.pos[0] - dest[0]).hypot(p.pos[1] - dest[1]);
                assert!(d <= *prev + 1e-3, "particle moved away from its landmark");
                *prev = d;
            }
        }

        for d in distances {
            assert!(d < 1.0, "particle failed to converge: {d}");
        }
    }

    #[test]
    fn test_out_of_range_target_is_drift_only() {
        let params = FireflyParams {
            claimed_probability: 1.0,
            ..quiet_params()
        };
        let mut with_frame = swarm(50, params.clone(), 13);
        let mut without = swarm(50, params, 13);
        for p in &mut with_frame.particles {
            p.target_object = 5;
        }
        for p in &mut without.particles {
            p.target_object = 5;
        }

        // The frame holds a single object, so index 5 resolves to nothing and
        // both runs must take the drift-only path.
        with_frame.step(&frame_with_point(0.5, 0.5), BOUNDS);
        without.step(&LandmarkFrame::default(), BOUNDS);

        assert_eq!(with_frame.particles(), without.particles());
    }

    #[test]
    fn test_retarget_keeps_indices_valid() {
        let mut swarm = swarm(100, FireflyParams::default(), 21);
        swarm.retarget(33);
        assert_eq!(swarm.landmark_count(), 33);
        for p in swarm.particles() {
            assert!(p.target_landmark < 33);
        }
    }
}
