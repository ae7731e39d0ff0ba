//! Walks the solution path backwards once a goal state is known: each
//! earlier closed group is re-expanded looking for the state whose child
//! is the current anchor. Progress persists to `solution.bin` after
//! every hop, so a stopped trace resumes where it left off.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::SiftError;
use crate::files;
use crate::pool;
use crate::problem::{frame_of, Frame, FrameGroup, PackedState, Problem};
use crate::search::Engine;
use crate::stream::NodeReader;

struct TraceCheckpoint<S> {
    group: FrameGroup,
    state: Vec<u8>,
    steps: Vec<S>,
}

impl<S: bincode::Encode> bincode::Encode for TraceCheckpoint<S> {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> Result<(), bincode::error::EncodeError> {
        self.group.encode(encoder)?;
        self.state.encode(encoder)?;
        self.steps.encode(encoder)?;
        Ok(())
    }
}

impl<S, C> bincode::Decode<C> for TraceCheckpoint<S>
where
    S: bincode::Decode<C>,
{
    fn decode<D: bincode::de::Decoder<Context = C>>(
        decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        Ok(Self {
            group: bincode::Decode::decode(decoder)?,
            state: bincode::Decode::decode(decoder)?,
            steps: bincode::Decode::decode(decoder)?,
        })
    }
}

impl<P: Problem> Engine<P> {
    /// Trace the path to a freshly discovered exit.
    pub fn trace_exit(&self, exit_state: P::State, exit_frame: Frame) -> Result<(), SiftError> {
        let anchor = self.problem().compress(&exit_state);
        let group = exit_frame / P::FRAMES_PER_GROUP;
        self.run_trace(anchor, exit_frame, group, Vec::new())
    }

    /// Continue a trace from the `solution.bin` checkpoint.
    pub fn resume_trace(&self) -> Result<(), SiftError> {
        let (group, anchor, steps) = self.load_checkpoint()?;
        let anchor_frame = frame_of::<P>(group, &anchor);
        self.run_trace(anchor, anchor_frame, group, steps)
    }

    /// Render whatever the checkpoint has so far, without touching it.
    pub fn write_partial_solution(&self) -> Result<(), SiftError> {
        let (_group, anchor, steps) = self.load_checkpoint()?;
        let state = self.problem().decompress(&anchor);
        self.emit_solution(&state, &steps)
    }

    fn run_trace(
        &self,
        mut anchor: P::Packed,
        mut anchor_frame: Frame,
        mut group: FrameGroup,
        mut steps: Vec<P::Step>,
    ) -> Result<(), SiftError> {
        loop {
            self.save_checkpoint(group, &anchor, &steps)?;
            if group == 0 {
                break;
            }
            group -= 1;

            let closed = self.layout().group_file("closed", group);
            if !closed.exists() {
                continue;
            }
            print!("[sift] tracing group {}... \r", group);

            let found: Mutex<Option<(P::State, Frame, P::Step)>> = Mutex::new(None);
            let found_flag = AtomicBool::new(false);
            let target = anchor;
            let target_frame = anchor_frame;

            #[cfg(debug_assertions)]
            let (queued, dequeued) = (
                std::sync::atomic::AtomicU64::new(0),
                std::sync::atomic::AtomicU64::new(0),
            );

            let handler = |packed: P::Packed| {
                #[cfg(debug_assertions)]
                dequeued.fetch_add(1, Ordering::Relaxed);
                self.find_parent(group, packed, &target, target_frame, &found, &found_flag);
                Ok(())
            };
            pool::run_phase(
                self.config().threads,
                self.config().ring_capacity,
                handler,
                |push| {
                    let mut reader =
                        NodeReader::<P::Packed>::open(&closed, self.buffer_records())?.verify_order();
                    while let Some(node) = reader.read()? {
                        #[cfg(debug_assertions)]
                        queued.fetch_add(1, Ordering::Relaxed);
                        push(node)?;
                        if found_flag.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                    Ok(())
                },
            )?;

            #[cfg(debug_assertions)]
            debug_assert_eq!(
                queued.load(Ordering::Relaxed),
                dequeued.load(Ordering::Relaxed),
                "trace fed and consumed record counts diverge"
            );

            let found_value = found.lock().expect("trace lock poisoned").take();
            if let Some((parent, parent_frame, step)) = found_value {
                println!("[sift] parent found at frame {}", parent_frame);
                if steps.len() >= P::MAX_STEPS {
                    return Err(SiftError::Search("solution exceeds the step limit".to_string()));
                }
                steps.push(step);
                anchor = self.problem().compress(&parent);
                anchor_frame = parent_frame;
                if parent_frame == 0 {
                    self.emit_solution(&parent, &steps)?;
                    files::delete(&self.layout().solution_checkpoint())?;
                    return Ok(());
                }
            }
        }
        Err(SiftError::Search(
            "lost parent node while tracing (corrupt closed files?)".to_string(),
        ))
    }

    /// Expand one closed state, checking whether any successor is the
    /// anchor. The first thread to find a parent wins; any correct
    /// parent yields a minimum-length path.
    fn find_parent(
        &self,
        group: FrameGroup,
        packed: P::Packed,
        target: &P::Packed,
        target_frame: Frame,
        found: &Mutex<Option<(P::State, Frame, P::Step)>>,
        found_flag: &AtomicBool,
    ) {
        if !self.problem().can_be_parent_and_child(&packed, target) {
            return;
        }
        let state = self.problem().decompress(&packed);
        let frame = frame_of::<P>(group, &packed);
        self.problem().expand(frame, &state, |parent, parent_frame, step, child, child_frame| {
            if child_frame == target_frame && self.problem().compress(child) == *target {
                let mut guard = found.lock().expect("trace lock poisoned");
                if guard.is_none() {
                    *guard = Some((parent.clone(), parent_frame, step));
                    found_flag.store(true, Ordering::Relaxed);
                }
            }
        });
    }

    fn emit_solution(&self, initial: &P::State, steps: &[P::Step]) -> Result<(), SiftError> {
        let ordered: Vec<P::Step> = steps.iter().rev().copied().collect();
        let rendered = crate::problem::render_solution(self.problem(), initial, &ordered)?;
        fs::write(self.layout().solution_text(), rendered)?;
        println!("[sift] solution written ({} steps)", ordered.len());
        Ok(())
    }

    fn save_checkpoint(
        &self,
        group: FrameGroup,
        anchor: &P::Packed,
        steps: &[P::Step],
    ) -> Result<(), SiftError> {
        let mut state = vec![0u8; P::Packed::BYTES];
        anchor.write_bytes(&mut state);
        let checkpoint = TraceCheckpoint { group, state, steps: steps.to_vec() };
        let bytes = bincode::encode_to_vec(&checkpoint, bincode::config::standard())?;
        let path = self.layout().solution_checkpoint();
        let staging = path.with_extension("bin.tmp");
        fs::write(&staging, bytes)?;
        files::rename(&staging, &path)
    }

    fn load_checkpoint(&self) -> Result<(FrameGroup, P::Packed, Vec<P::Step>), SiftError> {
        let path = self.layout().solution_checkpoint();
        if !path.exists() {
            return Err(SiftError::Search(
                "partial trace checkpoint (solution.bin) not found".to_string(),
            ));
        }
        let bytes = fs::read(&path)?;
        let (checkpoint, _): (TraceCheckpoint<P::Step>, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard())?;
        if checkpoint.state.len() != P::Packed::BYTES {
            return Err(SiftError::Corrupt(format!(
                "trace checkpoint holds a {}-byte state, expected {}",
                checkpoint.state.len(),
                P::Packed::BYTES
            )));
        }
        Ok((
            checkpoint.group,
            P::Packed::read_bytes(&checkpoint.state),
            checkpoint.steps,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchConfig;
    use crate::maze::{Maze, MazeState};
    use crate::search::Outcome;

    fn solved_engine(dir: &std::path::Path) -> Engine<Maze> {
        let eng = Engine::new(Maze::sample(), SearchConfig::custom(dir.to_path_buf())).unwrap();
        assert_eq!(eng.search(None).unwrap(), Outcome::Ok);
        eng
    }

    #[test]
    fn traced_solution_replays_to_the_finish() {
        let tmp = tempfile::tempdir().unwrap();
        let _eng = solved_engine(tmp.path());
        let text = std::fs::read_to_string(tmp.path().join("solution.txt")).unwrap();
        // The solution opens with the initial board and walks one step
        // per frame; the final board has the pawn on the finish cell.
        assert!(text.starts_with("#"));
        assert!(text.contains('@'));
        let steps: Vec<&str> = text.lines().filter(|l| l.contains("(frame ")).collect();
        assert!(!steps.is_empty());
        assert!(steps.last().unwrap().contains(&format!("(frame {})", steps.len())));
        let final_board = text.rsplit("(frame ").next().unwrap();
        assert!(!final_board.contains('F'), "pawn should cover the finish cell");
    }

    #[test]
    fn checkpoint_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let eng = Engine::new(Maze::sample(), SearchConfig::custom(tmp.path().to_path_buf())).unwrap();
        let maze = Maze::sample();
        let packed = maze.compress(&MazeState { x: 3, y: 5 });
        eng.save_checkpoint(7, &packed, &[crate::maze::Dir::Up, crate::maze::Dir::Left])
            .unwrap();
        let (group, anchor, steps) = eng.load_checkpoint().unwrap();
        assert_eq!(group, 7);
        assert_eq!(anchor, packed);
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn partial_solution_rendering_needs_a_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let eng = Engine::new(Maze::sample(), SearchConfig::custom(tmp.path().to_path_buf())).unwrap();
        assert!(matches!(eng.write_partial_solution(), Err(SiftError::Search(_))));
    }
}
