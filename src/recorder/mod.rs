// Episode recorder
//
// Idle -> Recording -> Idle. While recording, the control loop hands over one
// frame per tick. Ending an episode seals it (last frame done) and appends it
// to the dataset. Episodes that fail to persist stay queued and are retried on
// the next flush.

pub mod dataset;
pub mod observation;

use std::path::PathBuf;
use std::time::Instant;

use tracing::{info, warn};

pub use dataset::{Dataset, DatasetError, DatasetInfo, EpisodeInfo};
pub use observation::{OBSERVATION_DIM, ObservationBuilder};

use crate::config::RecordingConfig;
use crate::messages::MotorCommand;

/// One control tick as recorded
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub observation: Vec<f32>,
    /// Command actually dispatched, after the safety override
    pub action: MotorCommand,
    pub episode_index: u64,
    pub frame_index: u64,
    /// Seconds since the first frame of the episode
    pub timestamp: f64,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    pub index: u64,
    pub frames: Vec<Frame>,
    pub task: String,
}

impl Episode {
    fn new(index: u64, task: &str) -> Self {
        Self {
            index,
            frames: Vec::new(),
            task: task.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn duration(&self) -> f64 {
        self.frames.last().map_or(0.0, |f| f.timestamp)
    }

    fn seal(&mut self) {
        if let Some(last) = self.frames.last_mut() {
            last.done = true;
        }
    }
}

#[derive(Debug)]
pub enum RecorderState {
    Idle,
    Recording {
        episode: Episode,
        first_frame_at: Option<Instant>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("Already recording episode {episode_index}")]
    AlreadyRecording { episode_index: u64 },

    #[error("Not recording")]
    NotRecording,

    #[error("Failed to save dataset: {0}")]
    Persist(#[from] DatasetError),
}

/// What happened to an episode that was ended
#[derive(Debug, Clone, PartialEq)]
pub enum EpisodeOutcome {
    Saved {
        episode_index: u64,
        frames: usize,
        path: PathBuf,
    },
    /// Ended before any frame was recorded
    Discarded { episode_index: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RecordingStats {
    pub episodes: u64,
    pub frames: u64,
    pub duration: f64,
    pub discarded: u64,
}

#[derive(Debug)]
pub struct EpisodeRecorder {
    dataset: Dataset,
    state: RecorderState,
    /// Sealed episodes not yet on disk
    pending: Vec<Episode>,
    next_index: u64,
    task: String,
    stats: RecordingStats,
}

impl EpisodeRecorder {
    pub fn open(config: &RecordingConfig, fps: f64) -> Result<Self, RecordingError> {
        let dataset = Dataset::open(config.dataset_dir(), fps, OBSERVATION_DIM)?;
        Ok(Self::with_dataset(dataset, &config.task))
    }

    pub fn with_dataset(dataset: Dataset, task: &str) -> Self {
        let next_index = dataset.next_episode_index();
        Self {
            dataset,
            state: RecorderState::Idle,
            pending: Vec::new(),
            next_index,
            task: task.to_string(),
            stats: RecordingStats::default(),
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, RecorderState::Recording { .. })
    }

    /// Index of the episode being recorded
    pub fn episode_index(&self) -> Option<u64> {
        match &self.state {
            RecorderState::Recording { episode, .. } => Some(episode.index),
            RecorderState::Idle => None,
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn pending_episodes(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> RecordingStats {
        self.stats
    }

    pub fn start_episode(&mut self) -> Result<u64, RecordingError> {
        if let Some(episode_index) = self.episode_index() {
            return Err(RecordingError::AlreadyRecording { episode_index });
        }
        let index = self.next_index;
        self.state = RecorderState::Recording {
            episode: Episode::new(index, &self.task),
            first_frame_at: None,
        };
        info!("Recording episode {}", index);
        Ok(index)
    }

    /// Append this tick's frame. Returns false when idle.
    pub fn record(&mut self, observation: Vec<f32>, action: MotorCommand, now: Instant) -> bool {
        let RecorderState::Recording {
            episode,
            first_frame_at,
        } = &mut self.state
        else {
            return false;
        };

        let start = *first_frame_at.get_or_insert(now);
        episode.frames.push(Frame {
            observation,
            action,
            episode_index: episode.index,
            frame_index: episode.frames.len() as u64,
            timestamp: now.saturating_duration_since(start).as_secs_f64(),
            done: false,
        });
        true
    }

    /// Seal the running episode and write it out.
    ///
    /// On a persistence error the episode stays queued for the next flush.
    pub fn end_episode(&mut self) -> Result<EpisodeOutcome, RecordingError> {
        let RecorderState::Recording { mut episode, .. } =
            std::mem::replace(&mut self.state, RecorderState::Idle)
        else {
            return Err(RecordingError::NotRecording);
        };

        if episode.is_empty() {
            info!("Episode {} has no frames, discarding", episode.index);
            self.stats.discarded += 1;
            return Ok(EpisodeOutcome::Discarded {
                episode_index: episode.index,
            });
        }

        episode.seal();
        let episode_index = episode.index;
        let frames = episode.len();
        info!(
            "Episode {} ended: {} frames, {:.1}s",
            episode_index,
            frames,
            episode.duration()
        );

        self.next_index = episode_index + 1;
        self.pending.push(episode);
        let path = self.flush()?;

        Ok(EpisodeOutcome::Saved {
            episode_index,
            frames,
            path,
        })
    }

    /// Write every queued episode. Queue is kept if the write fails.
    pub fn flush(&mut self) -> Result<PathBuf, RecordingError> {
        if self.pending.is_empty() {
            return Ok(self.dataset.root().to_path_buf());
        }
        let path = self.dataset.append(&self.pending)?;
        for episode in self.pending.drain(..) {
            self.stats.episodes += 1;
            self.stats.frames += episode.len() as u64;
            self.stats.duration += episode.duration();
        }
        Ok(path)
    }

    /// Seal anything in flight and flush, then log totals
    pub fn shutdown(&mut self) -> Result<(), RecordingError> {
        let ended = if self.is_recording() {
            info!("Shutting down while recording, saving episode");
            self.end_episode().map(|_| ())
        } else {
            Ok(())
        };
        // end_episode already tried once; this retries anything still queued
        let flushed = self.flush().map(|_| ());

        let stats = self.stats;
        info!(
            "Recording stats: {} episodes, {} frames, {:.1}s recorded, {} discarded",
            stats.episodes, stats.frames, stats.duration, stats.discarded
        );
        if !self.pending.is_empty() {
            warn!("{} episodes could not be saved", self.pending.len());
        }
        ended.and(flushed)
    }
}
