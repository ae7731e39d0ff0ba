//! Built-in sample problem: a single pawn in a walled grid maze. One
//! action per frame, four actions. Small enough that the whole graph
//! fits in RAM many times over, which is exactly what makes it useful
//! for exercising the disk pipeline end to end.

use std::fmt;

use crate::error::SiftError;
use crate::problem::{Frame, PackedState, Problem};

const DX: [i32; 4] = [0, 1, 0, -1];
const DY: [i32; 4] = [-1, 0, 1, 0];

#[derive(Clone, Copy, PartialEq, Eq, Debug, bincode::Encode, bincode::Decode)]
pub enum Dir {
    Up,
    Right,
    Down,
    Left,
}

impl Dir {
    const ALL: [Dir; 4] = [Dir::Up, Dir::Right, Dir::Down, Dir::Left];
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dir::Up => "Up",
            Dir::Right => "Right",
            Dir::Down => "Down",
            Dir::Left => "Left",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MazeState {
    pub x: u16,
    pub y: u16,
}

/// Packed form: x and y as little-endian u16s, 32 payload bits, no
/// subframe (one frame per group).
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct MazePacked {
    pub x: u16,
    pub y: u16,
}

impl PackedState for MazePacked {
    const BYTES: usize = 4;

    fn write_bytes(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.x.to_le_bytes());
        out[2..4].copy_from_slice(&self.y.to_le_bytes());
    }

    fn read_bytes(bytes: &[u8]) -> Self {
        Self {
            x: u16::from_le_bytes([bytes[0], bytes[1]]),
            y: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }
}

pub struct Maze {
    rows: Vec<Vec<u8>>,
}

impl Maze {
    /// The 15x15 reference maze: two starts, one finish.
    pub fn sample() -> Self {
        Self::parse(
            "###############\n\
             #S#         # #\n\
             # ##### ### # #\n\
             #     #   #   #\n\
             #####   # # # #\n\
             #     # ### # #\n\
             # ### # #   # #\n\
             # # ### ##### #\n\
             # #   # #     #\n\
             ### # ### #####\n\
             #S# #     #   #\n\
             # # # # ### # #\n\
             # # # # #   # #\n\
             #   # #   # #F#\n\
             ###############",
        )
        .expect("sample maze is well formed")
    }

    /// Parse a maze from `#`/`S`/`F`/space rows. The border must be
    /// solid wall so moves never need bounds checks.
    pub fn parse(text: &str) -> Result<Self, SiftError> {
        let rows: Vec<Vec<u8>> = text.lines().map(|l| l.trim().as_bytes().to_vec()).collect();
        if rows.len() < 3 {
            return Err(SiftError::Config("maze needs at least 3 rows".to_string()));
        }
        let width = rows[0].len();
        for row in &rows {
            if row.len() != width {
                return Err(SiftError::Config("maze rows differ in length".to_string()));
            }
        }
        for x in 0..width {
            if rows[0][x] != b'#' || rows[rows.len() - 1][x] != b'#' {
                return Err(SiftError::Config("maze border must be wall".to_string()));
            }
        }
        for row in &rows {
            if row[0] != b'#' || row[width - 1] != b'#' {
                return Err(SiftError::Config("maze border must be wall".to_string()));
            }
        }
        Ok(Self { rows })
    }

    fn cell(&self, x: u16, y: u16) -> u8 {
        self.rows[y as usize][x as usize]
    }

    fn step(&self, state: &MazeState, dir: Dir) -> Option<MazeState> {
        let nx = (state.x as i32 + DX[dir as usize]) as u16;
        let ny = (state.y as i32 + DY[dir as usize]) as u16;
        if self.cell(nx, ny) == b'#' {
            return None;
        }
        Some(MazeState { x: nx, y: ny })
    }
}

impl Problem for Maze {
    const NAME: &'static str = "maze";
    const MAX_FRAMES: Frame = 128;
    const MAX_STEPS: usize = 128;
    const FRAMES_PER_GROUP: Frame = 1;
    const PAYLOAD_BITS: u32 = 32;

    type Packed = MazePacked;
    type State = MazeState;
    type Step = Dir;

    fn initial_states(&self) -> Vec<MazeState> {
        let mut starts = Vec::new();
        for (y, row) in self.rows.iter().enumerate() {
            for (x, &cell) in row.iter().enumerate() {
                if cell == b'S' {
                    starts.push(MazeState { x: x as u16, y: y as u16 });
                }
            }
        }
        starts.truncate(4);
        starts
    }

    fn is_finish(&self, state: &MazeState) -> bool {
        self.cell(state.x, state.y) == b'F'
    }

    fn compress(&self, state: &MazeState) -> MazePacked {
        MazePacked { x: state.x, y: state.y }
    }

    fn decompress(&self, packed: &MazePacked) -> MazeState {
        MazeState { x: packed.x, y: packed.y }
    }

    fn expand<F>(&self, frame: Frame, state: &MazeState, mut emit: F)
    where
        F: FnMut(&MazeState, Frame, Dir, &MazeState, Frame),
    {
        for dir in Dir::ALL {
            if let Some(next) = self.step(state, dir) {
                emit(state, frame, dir, &next, frame + 1);
            }
        }
    }

    fn replay(&self, state: &mut MazeState, step: Dir) -> Option<Frame> {
        let next = self.step(state, step)?;
        *state = next;
        Some(1)
    }

    fn render(&self, state: &MazeState) -> String {
        let mut out = String::new();
        for (y, row) in self.rows.iter().enumerate() {
            for (x, &cell) in row.iter().enumerate() {
                if x as u16 == state.x && y as u16 == state.y {
                    out.push('@');
                } else {
                    out.push(cell as char);
                }
            }
            out.push('\n');
        }
        out
    }
}
