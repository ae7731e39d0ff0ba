use std::fmt;

/// Cost of a path prefix, in frames.
pub type Frame = u32;
/// Index of a run of `FRAMES_PER_GROUP` contiguous frames.
pub type FrameGroup = u32;

/// Upper bound on the packed record width, used for stack scratch buffers.
pub const MAX_PACKED_BYTES: usize = 32;

/// Fixed-width on-disk representation of one game state.
///
/// The record is `BYTES` bytes of payload; when the problem groups frames
/// (`FRAMES_PER_GROUP > 1`) the trailing byte additionally carries the
/// subframe in its low bits. Implementations must uphold two contracts:
///
/// * `Eq` and `Ord` compare the payload only, never the subframe.
/// * `write_bytes`/`read_bytes` round-trip exactly, and a zeroed buffer
///   decodes to a record that compares equal to `Default::default()`.
pub trait PackedState: Copy + Default + Eq + Ord + Send + Sync + 'static {
    const BYTES: usize;

    fn write_bytes(&self, out: &mut [u8]);
    fn read_bytes(bytes: &[u8]) -> Self;

    fn subframe(&self) -> Frame {
        0
    }

    fn set_subframe(&mut self, _subframe: Frame) {}
}

/// The puzzle plugged into the engine. One problem type per build; the
/// engine is monomorphised over it so expansion stays free of dynamic
/// dispatch.
pub trait Problem: Send + Sync + Sized + 'static {
    const NAME: &'static str;
    /// Absolute upper bound on path cost. Dictates the frame-group count.
    const MAX_FRAMES: Frame;
    const MAX_STEPS: usize;
    /// Frames per group (K). Every move delay must be at least K, so a
    /// group never contains an edge into itself and can be closed in one
    /// pass.
    const FRAMES_PER_GROUP: Frame;
    /// Payload bits in the packed record, excluding the subframe.
    const PAYLOAD_BITS: u32;

    type Packed: PackedState;
    type State: Clone + PartialEq + Send + Sync;
    type Step: Copy + Send + Sync + fmt::Display + bincode::Encode + bincode::Decode<()>;

    /// Up to four starting states, all at frame 0.
    fn initial_states(&self) -> Vec<Self::State>;

    fn is_finish(&self, state: &Self::State) -> bool;

    fn compress(&self, state: &Self::State) -> Self::Packed;

    fn decompress(&self, packed: &Self::Packed) -> Self::State;

    /// Invoke `emit(parent, parent_frame, step, child, child_frame)` once
    /// per legal successor. `child_frame - parent_frame` is the move's
    /// delay and must be positive.
    fn expand<F>(&self, frame: Frame, state: &Self::State, emit: F)
    where
        F: FnMut(&Self::State, Frame, Self::Step, &Self::State, Frame);

    /// Conservative filter used while tracing the solution backwards:
    /// returning false skips decompressing and expanding this candidate
    /// parent. Must never return false for an actual parent.
    fn can_be_parent_and_child(&self, _parent: &Self::Packed, _child: &Self::Packed) -> bool {
        true
    }

    /// Apply one step to `state`, returning its frame delay, or None if
    /// the step is not legal from this state.
    fn replay(&self, state: &mut Self::State, step: Self::Step) -> Option<Frame>;

    /// Textual visualisation of a state, for dump/sample and solutions.
    fn render(&self, state: &Self::State) -> String;
}

/// Number of frame groups needed to cover `MAX_FRAMES`.
pub fn group_count<P: Problem>() -> FrameGroup {
    (P::MAX_FRAMES + P::FRAMES_PER_GROUP - 1) / P::FRAMES_PER_GROUP
}

/// The frame a record in group `group` represents.
pub fn frame_of<P: Problem>(group: FrameGroup, packed: &P::Packed) -> Frame {
    group * P::FRAMES_PER_GROUP + packed.subframe()
}

/// Render the finished solution: the initial state, then each step and
/// the state it leads to, replaying moves to validate their delays.
pub fn render_solution<P: Problem>(
    problem: &P,
    initial: &P::State,
    steps: &[P::Step],
) -> Result<String, crate::error::SiftError> {
    let mut out = String::new();
    let mut state = initial.clone();
    let mut frame: Frame = 0;
    out.push_str(&problem.render(&state));
    for step in steps {
        let delay = problem.replay(&mut state, *step).ok_or_else(|| {
            crate::error::SiftError::Search(format!("solution replay failed at step {}", step))
        })?;
        frame += delay;
        out.push_str(&format!("{} (frame {})\n", step, frame));
        out.push_str(&problem.render(&state));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maze::Maze;

    #[test]
    fn group_arithmetic() {
        assert_eq!(group_count::<Maze>(), Maze::MAX_FRAMES);
        let maze = Maze::sample();
        let packed = maze.compress(&maze.initial_states()[0]);
        assert_eq!(frame_of::<Maze>(7, &packed), 7);
    }
}
