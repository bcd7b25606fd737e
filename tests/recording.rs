// End-to-end recording through the control loop, no robot or network needed

use std::time::{Duration, Instant};

use toio_teleop_runtime::bridge::{ControllerSnapshot, OperatorRequest};
use toio_teleop_runtime::config::Config;
use toio_teleop_runtime::link::{LinkEvent, SensorEvent};
use toio_teleop_runtime::messages::{MotorCommand, RecordingCommand, StickSample};
use toio_teleop_runtime::recorder::{Dataset, EpisodeRecorder, OBSERVATION_DIM};
use toio_teleop_runtime::runtime::{Runtime, TickInputs};

const PERIOD_MS: u64 = 16;

struct Harness {
    runtime: Runtime,
    t0: Instant,
    tick: u64,
}

impl Harness {
    fn new(root: &std::path::Path) -> Self {
        let config = Config::default();
        let dataset = Dataset::open(root, config.control.rate_hz, OBSERVATION_DIM).unwrap();
        let recorder = EpisodeRecorder::with_dataset(dataset, &config.recording.task);
        let mut harness = Self {
            runtime: Runtime::new(&config, Some(recorder)),
            t0: Instant::now(),
            tick: 0,
        };
        harness.step(
            vec![LinkEvent::Connected {
                address: "AA:BB:CC:DD:EE:FF".to_string(),
            }],
            vec![],
        );
        harness
    }

    fn now(&self) -> Instant {
        self.t0 + Duration::from_millis(self.tick * PERIOD_MS)
    }

    fn step(&mut self, link_events: Vec<LinkEvent>, requests: Vec<OperatorRequest>) -> MotorCommand {
        self.tick += 1;
        let now = self.now();
        let controller = ControllerSnapshot {
            sample: Some(StickSample {
                x: 0.3,
                y: 0.8,
                timestamp: 0.0,
            }),
            received_at: Some(now),
            connected: true,
            latency_ms: None,
        };
        self.runtime
            .tick(
                now,
                TickInputs {
                    controller,
                    link_events,
                    requests,
                },
            )
            .command
    }

    fn request(&mut self, request: OperatorRequest) -> MotorCommand {
        self.step(vec![], vec![request])
    }
}

#[test]
fn test_episode_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("toio_dataset");
    let mut harness = Harness::new(&root);

    let n = 40;
    let mut dispatched = vec![harness.request(OperatorRequest::Recording(RecordingCommand::StartEpisode))];
    for i in 1..n {
        let events = if i == 10 {
            vec![LinkEvent::Sensor(SensorEvent::Collision)]
        } else {
            vec![]
        };
        dispatched.push(harness.step(events, vec![]));
    }
    harness.request(OperatorRequest::Recording(RecordingCommand::EndEpisode));

    let dataset = Dataset::open(&root, 60.0, OBSERVATION_DIM).unwrap();
    let frames = dataset.load_frames().unwrap();

    // The tick carrying the end request records nothing
    assert_eq!(frames.len(), n);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.episode_index, 0);
        assert_eq!(frame.frame_index, i as u64);
        assert_eq!(frame.done, i == n - 1);
        assert_eq!(frame.action, dispatched[i]);
        assert_eq!(frame.observation.len(), OBSERVATION_DIM);
    }
    assert_eq!(frames[0].timestamp, 0.0);
    assert!(frames.windows(2).all(|w| w[1].timestamp > w[0].timestamp));

    // Collision manoeuvre shows up in the observations
    assert_eq!(frames[9].observation, vec![0.0, 0.0, 0.0]);
    assert_eq!(frames[10].observation[0], 1.0);
    assert_eq!(frames[10].observation[1], 1.0);

    let episodes = dataset.episodes();
    assert_eq!(episodes.len(), 1);
    assert_eq!(episodes[0].num_frames, n as u64);
    assert_eq!(dataset.info().unwrap().total_frames, n as u64);
}

#[test]
fn test_recorded_action_is_post_estop() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("ds");
    let mut harness = Harness::new(&root);

    harness.request(OperatorRequest::Recording(RecordingCommand::StartEpisode));
    for _ in 0..20 {
        harness.step(vec![], vec![]);
    }
    let stopped = harness.request(OperatorRequest::Estop("test".to_string()));
    assert_eq!(stopped, MotorCommand::STOP);
    harness.step(vec![], vec![]);
    harness.request(OperatorRequest::Recording(RecordingCommand::EndEpisode));

    let frames = Dataset::open(&root, 60.0, OBSERVATION_DIM)
        .unwrap()
        .load_frames()
        .unwrap();
    assert_eq!(frames.len(), 23);
    assert!(!frames[20].action.is_stop());
    // Stick still pushed forward, yet the recorded action is what was sent
    assert!(frames[21].action.is_stop());
    assert!(frames[22].action.is_stop());
}

#[test]
fn test_ending_idle_recording_creates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("ds");
    let mut harness = Harness::new(&root);

    harness.request(OperatorRequest::Recording(RecordingCommand::EndEpisode));
    harness.request(OperatorRequest::Recording(RecordingCommand::EndEpisode));

    let dataset = Dataset::open(&root, 60.0, OBSERVATION_DIM).unwrap();
    assert!(dataset.episodes().is_empty());
    assert!(dataset.load_frames().unwrap().is_empty());
    assert!(!root.join("data.npz").exists());
}

#[test]
fn test_shutdown_flushes_in_flight_episode() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("ds");
    let mut harness = Harness::new(&root);

    harness.request(OperatorRequest::Recording(RecordingCommand::StartEpisode));
    for _ in 0..4 {
        harness.step(vec![], vec![]);
    }
    harness.runtime.shutdown().unwrap();

    let frames = Dataset::open(&root, 60.0, OBSERVATION_DIM)
        .unwrap()
        .load_frames()
        .unwrap();
    assert_eq!(frames.len(), 5);
    assert!(frames[4].done);
}

#[test]
fn test_second_session_continues_episode_indices() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("ds");

    for _ in 0..2 {
        let mut harness = Harness::new(&root);
        harness.request(OperatorRequest::Recording(RecordingCommand::StartEpisode));
        harness.step(vec![], vec![]);
        harness.request(OperatorRequest::Recording(RecordingCommand::EndEpisode));
    }

    let dataset = Dataset::open(&root, 60.0, OBSERVATION_DIM).unwrap();
    let indices: Vec<u64> = dataset.episodes().iter().map(|e| e.episode_index).collect();
    assert_eq!(indices, vec![0, 1]);
    let frames = dataset.load_frames().unwrap();
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[2].episode_index, 1);
    assert_eq!(frames[2].frame_index, 0);
}
