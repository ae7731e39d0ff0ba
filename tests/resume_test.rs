use sift::config::SearchConfig;
use sift::maze::Maze;
use sift::{Engine, Outcome};

fn engine(dir: &std::path::Path) -> Engine<Maze> {
    Engine::new(Maze::sample(), SearchConfig::custom(dir.to_path_buf())).unwrap()
}

fn closed_files(dir: &std::path::Path) -> Vec<(u32, Vec<u8>)> {
    let mut out = Vec::new();
    for g in 0..1000 {
        let path = dir.join(format!("closed-{}.bin", g));
        if path.exists() {
            out.push((g, std::fs::read(&path).unwrap()));
        }
    }
    out
}

#[test]
fn stopping_after_every_group_converges_to_the_baseline() {
    let baseline_dir = tempfile::tempdir().unwrap();
    assert_eq!(engine(baseline_dir.path()).search(None).unwrap(), Outcome::Ok);
    let baseline = closed_files(baseline_dir.path());

    // Same search, but a stop request lands after every single group, so
    // the whole run is a chain of resumes.
    let tmp = tempfile::tempdir().unwrap();
    let mut runs = 0;
    loop {
        runs += 1;
        assert!(runs < 200, "search makes no progress");
        std::fs::write(tmp.path().join("stop.txt"), b"").unwrap();
        match engine(tmp.path()).search(None).unwrap() {
            Outcome::Stopped => continue,
            Outcome::Ok => break,
            Outcome::NotFound => panic!("exit must be reachable"),
        }
    }
    // The stop file of the final (successful) run is left unconsumed.
    let _ = std::fs::remove_file(tmp.path().join("stop.txt"));

    assert_eq!(closed_files(tmp.path()), baseline);
    assert_eq!(
        std::fs::read(tmp.path().join("solution.txt")).unwrap(),
        std::fs::read(baseline_dir.path().join("solution.txt")).unwrap()
    );
}

#[test]
fn leftover_closing_scratch_is_overwritten_on_restart() {
    let baseline_dir = tempfile::tempdir().unwrap();
    assert_eq!(engine(baseline_dir.path()).search(None).unwrap(), Outcome::Ok);
    let baseline = closed_files(baseline_dir.path());

    // Interrupt after group 6, then plant a torn closing-7 as if the
    // process had been killed mid-write of the next step.
    let tmp = tempfile::tempdir().unwrap();
    assert_eq!(engine(tmp.path()).search(Some(7)).unwrap(), Outcome::NotFound);
    std::fs::write(tmp.path().join("closing-7.bin"), [0xAAu8; 12]).unwrap();

    assert_eq!(engine(tmp.path()).search(None).unwrap(), Outcome::Ok);
    assert_eq!(closed_files(tmp.path()), baseline);
}

#[test]
fn leftover_merged_file_is_reused() {
    let baseline_dir = tempfile::tempdir().unwrap();
    assert_eq!(engine(baseline_dir.path()).search(None).unwrap(), Outcome::Ok);
    let baseline = closed_files(baseline_dir.path());

    // Stop after group 4, then run the sort of group 5 by hand: the
    // restart must pick up merged-5 instead of re-sorting.
    let tmp = tempfile::tempdir().unwrap();
    assert_eq!(engine(tmp.path()).search(Some(5)).unwrap(), Outcome::NotFound);
    {
        let eng = engine(tmp.path());
        sift::pipeline::sort_and_merge::<sift::maze::MazePacked>(eng.config(), eng.layout(), 5)
            .unwrap();
    }
    assert!(tmp.path().join("merged-5.bin").exists());

    assert_eq!(engine(tmp.path()).search(None).unwrap(), Outcome::Ok);
    assert_eq!(closed_files(tmp.path()), baseline);
}

#[test]
fn bounded_runs_resume_where_they_stopped() {
    let baseline_dir = tempfile::tempdir().unwrap();
    assert_eq!(engine(baseline_dir.path()).search(None).unwrap(), Outcome::Ok);
    let baseline = closed_files(baseline_dir.path());

    let tmp = tempfile::tempdir().unwrap();
    assert_eq!(engine(tmp.path()).search(Some(3)).unwrap(), Outcome::NotFound);
    assert_eq!(engine(tmp.path()).search(Some(11)).unwrap(), Outcome::NotFound);
    assert_eq!(engine(tmp.path()).search(None).unwrap(), Outcome::Ok);
    assert_eq!(closed_files(tmp.path()), baseline);
}
