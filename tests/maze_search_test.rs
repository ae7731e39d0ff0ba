use std::collections::VecDeque;

use sift::config::SearchConfig;
use sift::maze::{Maze, MazeState};
use sift::problem::Problem;
use sift::{Engine, Outcome};

/// Reference shortest-path distances computed with a plain in-memory BFS
/// over the same problem callbacks the engine uses.
fn reference_distances(maze: &Maze) -> std::collections::HashMap<(u16, u16), u32> {
    let mut dist = std::collections::HashMap::new();
    let mut queue = VecDeque::new();
    for start in maze.initial_states() {
        dist.insert((start.x, start.y), 0);
        queue.push_back(start);
    }
    while let Some(state) = queue.pop_front() {
        let d = dist[&(state.x, state.y)];
        if maze.is_finish(&state) {
            continue;
        }
        maze.expand(d, &state, |_p, _pf, _step, child, child_frame| {
            if !dist.contains_key(&(child.x, child.y)) {
                dist.insert((child.x, child.y), child_frame);
                queue.push_back(*child);
            }
        });
    }
    dist
}

fn read_closed(dir: &std::path::Path, g: u32) -> Vec<MazeState> {
    let bytes = std::fs::read(dir.join(format!("closed-{}.bin", g))).unwrap();
    assert_eq!(bytes.len() % 4, 0);
    bytes
        .chunks(4)
        .map(|c| MazeState {
            x: u16::from_le_bytes([c[0], c[1]]),
            y: u16::from_le_bytes([c[2], c[3]]),
        })
        .collect()
}

#[test]
fn search_closes_every_group_at_its_shortest_distance() {
    let tmp = tempfile::tempdir().unwrap();
    let maze = Maze::sample();
    let reference = reference_distances(&maze);
    let goal_frame = *reference.get(&(13, 13)).expect("finish reachable");

    let engine = Engine::new(Maze::sample(), SearchConfig::custom(tmp.path().to_path_buf())).unwrap();
    assert_eq!(engine.search(None).unwrap(), Outcome::Ok);

    // Two starts close at frame 0.
    let closed0 = read_closed(tmp.path(), 0);
    assert_eq!(closed0.len(), 2);

    // Every closed record sits at exactly its shortest distance, and no
    // group beyond the goal frame was closed.
    let maze = Maze::sample();
    for g in 0..goal_frame {
        let closed = read_closed(tmp.path(), g);
        assert!(!closed.is_empty(), "group {} unexpectedly empty", g);
        for state in &closed {
            assert_eq!(
                reference[&(state.x, state.y)],
                g,
                "state {:?} closed at the wrong frame",
                state
            );
            assert!(!maze.is_finish(state), "finish state should never close");
        }
    }
    assert!(!tmp.path().join(format!("closed-{}.bin", goal_frame)).exists());

    // The solution has exactly goal_frame steps: one per line of the form
    // "<dir> (frame N)", ending at the goal frame.
    let text = std::fs::read_to_string(tmp.path().join("solution.txt")).unwrap();
    let steps: Vec<&str> = text.lines().filter(|l| l.contains("(frame ")).collect();
    assert_eq!(steps.len() as u32, goal_frame);
    assert!(steps.last().unwrap().contains(&format!("(frame {})", goal_frame)));
}

#[test]
fn closed_files_verify_clean_and_disjoint() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Engine::new(Maze::sample(), SearchConfig::custom(tmp.path().to_path_buf())).unwrap();
    assert_eq!(engine.search(None).unwrap(), Outcome::Ok);

    let mut seen = std::collections::HashSet::new();
    for g in 0..engine.groups() {
        let path = tmp.path().join(format!("closed-{}.bin", g));
        if !path.exists() {
            continue;
        }
        engine.verify(&path).unwrap();
        let mut previous: Option<MazeState> = None;
        for state in read_closed(tmp.path(), g) {
            if let Some(prev) = previous {
                assert!((prev.x, prev.y) < (state.x, state.y), "closed-{} not sorted", g);
            }
            assert!(seen.insert((state.x, state.y)), "payload closed twice");
            previous = Some(state);
        }
    }

    // Flipping a byte makes verify report findings but it stays a
    // diagnostic pass, not an error.
    let victim = tmp.path().join("closed-5.bin");
    let mut bytes = std::fs::read(&victim).unwrap();
    bytes[0] ^= 0xFF;
    std::fs::write(&victim, &bytes).unwrap();
    engine.verify(&victim).unwrap();
}

#[test]
fn tiny_cache_produces_identical_closed_sets() {
    // The cache is a hint: shrinking it to near nothing changes only the
    // volume of duplicate writes, never what gets closed.
    let tmp_a = tempfile::tempdir().unwrap();
    let tmp_b = tempfile::tempdir().unwrap();

    let normal = Engine::new(Maze::sample(), SearchConfig::custom(tmp_a.path().to_path_buf())).unwrap();
    assert_eq!(normal.search(None).unwrap(), Outcome::Ok);

    let mut cfg = SearchConfig::custom(tmp_b.path().to_path_buf());
    cfg.ram_bytes = 64; // a handful of cache nodes
    cfg.cache_ways = 1;
    let starved = Engine::new(Maze::sample(), cfg).unwrap();
    assert_eq!(starved.search(None).unwrap(), Outcome::Ok);

    for g in 0.. {
        let a = tmp_a.path().join(format!("closed-{}.bin", g));
        let b = tmp_b.path().join(format!("closed-{}.bin", g));
        match (a.exists(), b.exists()) {
            (false, false) => break,
            (true, true) => assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap()),
            _ => panic!("closed sets diverge at group {}", g),
        }
    }
}
