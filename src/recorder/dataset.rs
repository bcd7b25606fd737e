// Persisted dataset consumed by training, inference and replay tooling
//
// <root>/data.npz            columnar frame table, one row per frame
//     observation.state  float32 [N, observation_dim]
//     action             float32 [N, 2]  (left, right)
//     episode_index      int64   [N]
//     frame_index        int64   [N]
//     timestamp          float32 [N]     seconds since episode start
//     next.done          bool    [N]     true on the last frame of an episode
// <root>/meta/info.json      dataset-level facts
// <root>/meta/episodes.json  per-episode offset and length
//
// Appends rewrite the files through temporaries that are renamed into place,
// so a failed write leaves the previous dataset intact.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, Axis, Slice, concatenate};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError, ReadableElement, WriteNpzError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Episode, Frame};
use crate::messages::MotorCommand;

pub const DATA_FILE: &str = "data.npz";
pub const META_DIR: &str = "meta";
pub const INFO_FILE: &str = "info.json";
pub const EPISODES_FILE: &str = "episodes.json";

pub const ACTION_DIM: usize = 2;
pub const ACTION_NAMES: [&str; ACTION_DIM] = ["left_motor", "right_motor"];

const OBSERVATION_KEY: &str = "observation.state";
const ACTION_KEY: &str = "action";
const EPISODE_INDEX_KEY: &str = "episode_index";
const FRAME_INDEX_KEY: &str = "frame_index";
const TIMESTAMP_KEY: &str = "timestamp";
const DONE_KEY: &str = "next.done";

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write npz: {0}")]
    WriteNpz(#[from] WriteNpzError),

    #[error("Failed to read npz: {0}")]
    ReadNpz(#[from] ReadNpzError),

    #[error("Invalid metadata: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Inconsistent dataset: {0}")]
    Inconsistent(String),
}

pub type Result<T> = std::result::Result<T, DatasetError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureInfo {
    pub dtype: String,
    pub shape: Vec<usize>,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub fps: f64,
    pub total_episodes: u64,
    pub total_frames: u64,
    pub observation_dim: usize,
    pub action_dim: usize,
    pub features: BTreeMap<String, FeatureInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeInfo {
    pub episode_index: u64,
    /// Row of the episode's first frame in data.npz
    pub from_frame: u64,
    pub num_frames: u64,
    pub duration: f64,
    pub task: String,
}

#[derive(Debug)]
pub struct Dataset {
    root: PathBuf,
    fps: f64,
    observation_dim: usize,
    info: Option<DatasetInfo>,
    episodes: Vec<EpisodeInfo>,
}

impl Dataset {
    /// Open a dataset directory, picking up whatever is already there
    pub fn open(root: impl Into<PathBuf>, fps: f64, observation_dim: usize) -> Result<Self> {
        let root = root.into();
        let meta = root.join(META_DIR);

        let info: Option<DatasetInfo> = read_json(&meta.join(INFO_FILE))?;
        let episodes: Vec<EpisodeInfo> = read_json(&meta.join(EPISODES_FILE))?.unwrap_or_default();

        if let Some(info) = &info {
            if info.observation_dim != observation_dim {
                return Err(DatasetError::Inconsistent(format!(
                    "existing observation_dim {} != {}",
                    info.observation_dim, observation_dim
                )));
            }
        }

        if episodes.is_empty() {
            info!("Starting new dataset at {}", root.display());
        } else {
            info!(
                "Found existing dataset at {} with {} episodes",
                root.display(),
                episodes.len()
            );
        }

        Ok(Self {
            root,
            fps,
            observation_dim,
            info,
            episodes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_path(&self) -> PathBuf {
        self.root.join(DATA_FILE)
    }

    pub fn info(&self) -> Option<&DatasetInfo> {
        self.info.as_ref()
    }

    pub fn episodes(&self) -> &[EpisodeInfo] {
        &self.episodes
    }

    pub fn total_frames(&self) -> u64 {
        self.episodes.iter().map(|e| e.num_frames).sum()
    }

    /// Index for the next episode, continuing after the persisted ones
    pub fn next_episode_index(&self) -> u64 {
        self.episodes
            .iter()
            .map(|e| e.episode_index + 1)
            .max()
            .unwrap_or(0)
    }

    /// Append sealed episodes. Nothing in memory changes unless every file was written.
    pub fn append(&mut self, episodes: &[Episode]) -> Result<PathBuf> {
        let frames: Vec<&Frame> = episodes.iter().flat_map(|e| e.frames.iter()).collect();
        if frames.is_empty() {
            return Ok(self.root.clone());
        }

        let meta = self.root.join(META_DIR);
        fs::create_dir_all(&meta)?;

        let new_columns = FrameColumns::from_frames(&frames, self.observation_dim)?;
        let data_path = self.data_path();
        let columns = if data_path.exists() {
            debug!("Merging with existing {}", data_path.display());
            self.indexed_rows(FrameColumns::read(&data_path)?)?.concat(&new_columns)?
        } else {
            new_columns
        };

        let mut index = self.episodes.clone();
        let mut offset = self.total_frames();
        for episode in episodes.iter().filter(|e| !e.frames.is_empty()) {
            let num_frames = episode.frames.len() as u64;
            index.push(EpisodeInfo {
                episode_index: episode.index,
                from_frame: offset,
                num_frames,
                duration: episode.duration(),
                task: episode.task.clone(),
            });
            offset += num_frames;
        }

        if columns.len() as u64 != offset {
            return Err(DatasetError::Inconsistent(format!(
                "{} rows in {} but episode index covers {}",
                columns.len(),
                DATA_FILE,
                offset
            )));
        }

        let now = Utc::now();
        let info = DatasetInfo {
            fps: self.fps,
            total_episodes: index.len() as u64,
            total_frames: offset,
            observation_dim: self.observation_dim,
            action_dim: ACTION_DIM,
            features: features(self.observation_dim),
            created_at: self.info.as_ref().map_or(now, |i| i.created_at),
            updated_at: now,
        };

        // Stage everything, then swap in
        let data_tmp = tmp_path(&data_path);
        let episodes_path = meta.join(EPISODES_FILE);
        let episodes_tmp = tmp_path(&episodes_path);
        let info_path = meta.join(INFO_FILE);
        let info_tmp = tmp_path(&info_path);

        columns.write(&data_tmp)?;
        write_json(&episodes_tmp, &index)?;
        write_json(&info_tmp, &info)?;

        fs::rename(&data_tmp, &data_path)?;
        fs::rename(&episodes_tmp, &episodes_path)?;
        fs::rename(&info_tmp, &info_path)?;

        info!(
            "Saved dataset to {}: +{} episodes, {} episodes / {} frames total",
            self.root.display(),
            index.len() - self.episodes.len(),
            info.total_episodes,
            info.total_frames
        );

        self.episodes = index;
        self.info = Some(info);
        Ok(self.root.clone())
    }

    /// Read every persisted frame back, in file order
    pub fn load_frames(&self) -> Result<Vec<Frame>> {
        let path = self.data_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(self.indexed_rows(FrameColumns::read(&path)?)?.into_frames())
    }

    /// Keep only the rows the episode index covers. Extra rows are left over
    /// from a save whose data file was swapped in but whose index was not.
    fn indexed_rows(&self, columns: FrameColumns) -> Result<FrameColumns> {
        let indexed = self.total_frames() as usize;
        match columns.len() {
            n if n == indexed => Ok(columns),
            n if n > indexed => {
                debug!("Ignoring {} unindexed rows in {}", n - indexed, DATA_FILE);
                Ok(columns.head(indexed))
            }
            n => Err(DatasetError::Inconsistent(format!(
                "{} rows in {} but episode index covers {}",
                n, DATA_FILE, indexed
            ))),
        }
    }
}

fn features(observation_dim: usize) -> BTreeMap<String, FeatureInfo> {
    let mut observation_names: Vec<String> = super::observation::OBSERVATION_NAMES
        .iter()
        .map(|s| s.to_string())
        .collect();
    observation_names.resize_with(observation_dim, String::new);

    let mut features = BTreeMap::new();
    features.insert(
        OBSERVATION_KEY.to_string(),
        FeatureInfo {
            dtype: "float32".to_string(),
            shape: vec![observation_dim],
            names: observation_names,
        },
    );
    features.insert(
        ACTION_KEY.to_string(),
        FeatureInfo {
            dtype: "float32".to_string(),
            shape: vec![ACTION_DIM],
            names: ACTION_NAMES.iter().map(|s| s.to_string()).collect(),
        },
    );
    features
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let reader = BufReader::new(File::open(path)?);
    Ok(Some(serde_json::from_reader(reader)?))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, value)?;
    Ok(())
}

/// The frame table in columnar form
#[derive(Debug, Clone)]
struct FrameColumns {
    observation: Array2<f32>,
    action: Array2<f32>,
    episode_index: Array1<i64>,
    frame_index: Array1<i64>,
    timestamp: Array1<f32>,
    done: Array1<bool>,
}

impl FrameColumns {
    fn from_frames(frames: &[&Frame], observation_dim: usize) -> Result<Self> {
        let n = frames.len();
        let mut observation = Vec::with_capacity(n * observation_dim);
        let mut action = Vec::with_capacity(n * ACTION_DIM);

        for frame in frames {
            if frame.observation.len() != observation_dim {
                return Err(DatasetError::Inconsistent(format!(
                    "frame {} of episode {} has {} observation values, expected {}",
                    frame.frame_index,
                    frame.episode_index,
                    frame.observation.len(),
                    observation_dim
                )));
            }
            observation.extend_from_slice(&frame.observation);
            action.push(frame.action.left as f32);
            action.push(frame.action.right as f32);
        }

        Ok(Self {
            observation: Array2::from_shape_vec((n, observation_dim), observation)?,
            action: Array2::from_shape_vec((n, ACTION_DIM), action)?,
            episode_index: frames.iter().map(|f| f.episode_index as i64).collect(),
            frame_index: frames.iter().map(|f| f.frame_index as i64).collect(),
            timestamp: frames.iter().map(|f| f.timestamp as f32).collect(),
            done: frames.iter().map(|f| f.done).collect(),
        })
    }

    fn len(&self) -> usize {
        self.episode_index.len()
    }

    fn head(&self, n: usize) -> Self {
        let rows = || Slice::from(..n);
        Self {
            observation: self.observation.slice_axis(Axis(0), rows()).to_owned(),
            action: self.action.slice_axis(Axis(0), rows()).to_owned(),
            episode_index: self.episode_index.slice_axis(Axis(0), rows()).to_owned(),
            frame_index: self.frame_index.slice_axis(Axis(0), rows()).to_owned(),
            timestamp: self.timestamp.slice_axis(Axis(0), rows()).to_owned(),
            done: self.done.slice_axis(Axis(0), rows()).to_owned(),
        }
    }

    fn concat(&self, other: &FrameColumns) -> Result<Self> {
        if self.observation.ncols() != other.observation.ncols() {
            return Err(DatasetError::Inconsistent(format!(
                "observation width {} in file, {} in new frames",
                self.observation.ncols(),
                other.observation.ncols()
            )));
        }
        Ok(Self {
            observation: concatenate(Axis(0), &[self.observation.view(), other.observation.view()])?,
            action: concatenate(Axis(0), &[self.action.view(), other.action.view()])?,
            episode_index: concatenate(Axis(0), &[self.episode_index.view(), other.episode_index.view()])?,
            frame_index: concatenate(Axis(0), &[self.frame_index.view(), other.frame_index.view()])?,
            timestamp: concatenate(Axis(0), &[self.timestamp.view(), other.timestamp.view()])?,
            done: concatenate(Axis(0), &[self.done.view(), other.done.view()])?,
        })
    }

    fn write(&self, path: &Path) -> Result<()> {
        let mut npz = NpzWriter::new_compressed(BufWriter::new(File::create(path)?));
        npz.add_array(OBSERVATION_KEY, &self.observation)?;
        npz.add_array(ACTION_KEY, &self.action)?;
        npz.add_array(EPISODE_INDEX_KEY, &self.episode_index)?;
        npz.add_array(FRAME_INDEX_KEY, &self.frame_index)?;
        npz.add_array(TIMESTAMP_KEY, &self.timestamp)?;
        npz.add_array(DONE_KEY, &self.done)?;
        npz.finish()?;
        Ok(())
    }

    fn read(path: &Path) -> Result<Self> {
        let mut npz = NpzReader::new(BufReader::new(File::open(path)?))?;
        let columns = Self {
            observation: read_array(&mut npz, OBSERVATION_KEY)?,
            action: read_array(&mut npz, ACTION_KEY)?,
            episode_index: read_array(&mut npz, EPISODE_INDEX_KEY)?,
            frame_index: read_array(&mut npz, FRAME_INDEX_KEY)?,
            timestamp: read_array(&mut npz, TIMESTAMP_KEY)?,
            done: read_array(&mut npz, DONE_KEY)?,
        };

        let n = columns.len();
        let lengths = [
            columns.observation.nrows(),
            columns.action.nrows(),
            columns.frame_index.len(),
            columns.timestamp.len(),
            columns.done.len(),
        ];
        if lengths.iter().any(|&len| len != n) || columns.action.ncols() != ACTION_DIM {
            return Err(DatasetError::Inconsistent(format!(
                "column lengths differ in {}",
                path.display()
            )));
        }
        Ok(columns)
    }

    fn into_frames(self) -> Vec<Frame> {
        (0..self.len())
            .map(|i| Frame {
                observation: self.observation.row(i).to_vec(),
                action: MotorCommand::new(
                    self.action[[i, 0]].round() as i32,
                    self.action[[i, 1]].round() as i32,
                ),
                episode_index: self.episode_index[i] as u64,
                frame_index: self.frame_index[i] as u64,
                timestamp: self.timestamp[i] as f64,
                done: self.done[i],
            })
            .collect()
    }
}

/// Archive members may or may not carry the `.npy` suffix depending on the writer
fn read_array<A, D, R>(npz: &mut NpzReader<R>, key: &str) -> Result<ndarray::Array<A, D>>
where
    A: ReadableElement,
    D: ndarray::Dimension,
    R: std::io::Read + std::io::Seek,
{
    match npz.by_name(&format!("{}.npy", key)) {
        Ok(array) => Ok(array),
        Err(_) => Ok(npz.by_name(key)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::observation::OBSERVATION_DIM;

    fn episode(index: u64, len: usize) -> Episode {
        let frames = (0..len)
            .map(|i| Frame {
                observation: vec![0.0, 0.0, i as f32 / 10.0],
                action: MotorCommand {
                    left: i as i8,
                    right: -(i as i8),
                },
                episode_index: index,
                frame_index: i as u64,
                timestamp: i as f64 / 60.0,
                done: i + 1 == len,
            })
            .collect();
        Episode {
            index,
            frames,
            task: "test".to_string(),
        }
    }

    #[test]
    fn test_append_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut dataset = Dataset::open(dir.path().join("ds"), 60.0, OBSERVATION_DIM).unwrap();
        assert_eq!(dataset.next_episode_index(), 0);

        dataset.append(&[episode(0, 5), episode(1, 3)]).unwrap();

        let frames = dataset.load_frames().unwrap();
        assert_eq!(frames.len(), 8);
        assert_eq!(frames[4].episode_index, 0);
        assert!(frames[4].done);
        assert_eq!(frames[5].episode_index, 1);
        assert_eq!(frames[5].frame_index, 0);
        assert_eq!(frames[6].action, MotorCommand { left: 1, right: -1 });
        assert!((frames[7].timestamp - 2.0 / 60.0).abs() < 1e-6);

        let index = dataset.episodes();
        assert_eq!(index.len(), 2);
        assert_eq!((index[0].from_frame, index[0].num_frames), (0, 5));
        assert_eq!((index[1].from_frame, index[1].num_frames), (5, 3));

        let info = dataset.info().unwrap();
        assert_eq!(info.total_frames, 8);
        assert_eq!(info.total_episodes, 2);
        assert_eq!(info.observation_dim, OBSERVATION_DIM);
        assert_eq!(info.action_dim, 2);
    }

    #[test]
    fn test_reopen_appends_after_existing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ds");
        {
            let mut dataset = Dataset::open(&root, 60.0, OBSERVATION_DIM).unwrap();
            dataset.append(&[episode(0, 4)]).unwrap();
        }

        let mut dataset = Dataset::open(&root, 60.0, OBSERVATION_DIM).unwrap();
        assert_eq!(dataset.next_episode_index(), 1);
        let created = dataset.info().unwrap().created_at;

        dataset.append(&[episode(1, 2)]).unwrap();
        assert_eq!(dataset.episodes()[1].from_frame, 4);
        assert_eq!(dataset.load_frames().unwrap().len(), 6);
        assert_eq!(dataset.info().unwrap().created_at, created);
        assert!(!root.join("data.npz.tmp").exists());
    }

    #[test]
    fn test_metadata_files_are_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut dataset = Dataset::open(dir.path(), 30.0, OBSERVATION_DIM).unwrap();
        dataset.append(&[episode(0, 2)]).unwrap();

        let info: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("meta/info.json")).unwrap())
                .unwrap();
        assert_eq!(info["fps"], 30.0);
        assert_eq!(info["features"]["action"]["names"][0], "left_motor");
        assert_eq!(info["features"]["observation.state"]["shape"][0], 3);

        let episodes: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("meta/episodes.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(episodes[0]["num_frames"], 2);
    }

    #[test]
    fn test_observation_width_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut dataset = Dataset::open(dir.path(), 60.0, 2).unwrap();
        assert!(matches!(
            dataset.append(&[episode(0, 1)]),
            Err(DatasetError::Inconsistent(_))
        ));
        assert!(dataset.episodes().is_empty());
    }

    #[test]
    fn test_write_failure_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        // A plain file where the dataset directory should be
        let blocker = dir.path().join("blocked");
        fs::write(&blocker, b"").unwrap();

        let mut dataset = Dataset::open(&blocker, 60.0, OBSERVATION_DIM).unwrap();
        assert!(dataset.append(&[episode(0, 3)]).is_err());
        assert!(dataset.episodes().is_empty());
        assert_eq!(dataset.next_episode_index(), 0);
    }

    #[test]
    fn test_retry_after_partial_swap_drops_orphan_rows() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ds");
        let mut dataset = Dataset::open(&root, 60.0, OBSERVATION_DIM).unwrap();

        // The index can't be swapped in, but the data file already was
        let episodes_path = root.join(META_DIR).join(EPISODES_FILE);
        fs::create_dir_all(&episodes_path).unwrap();
        assert!(dataset.append(&[episode(0, 3)]).is_err());
        assert!(dataset.episodes().is_empty());
        assert!(dataset.data_path().exists());
        assert!(dataset.load_frames().unwrap().is_empty());

        fs::remove_dir(&episodes_path).unwrap();
        dataset.append(&[episode(0, 3)]).unwrap();
        assert_eq!(dataset.load_frames().unwrap().len(), 3);

        let reopened = Dataset::open(&root, 60.0, OBSERVATION_DIM).unwrap();
        assert_eq!(reopened.episodes().len(), 1);
        assert_eq!(reopened.episodes()[0].num_frames, 3);
        let frames = reopened.load_frames().unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.episode_index == 0));
        assert_eq!(reopened.info().unwrap().total_frames, 3);
    }

    #[test]
    fn test_missing_rows_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ds");
        let mut dataset = Dataset::open(&root, 60.0, OBSERVATION_DIM).unwrap();
        dataset.append(&[episode(0, 4)]).unwrap();

        // Index claims more frames than the data file holds
        let short = dir.path().join("short");
        let mut other = Dataset::open(&short, 60.0, OBSERVATION_DIM).unwrap();
        other.append(&[episode(0, 2)]).unwrap();
        fs::copy(other.data_path(), dataset.data_path()).unwrap();

        assert!(matches!(
            dataset.load_frames(),
            Err(DatasetError::Inconsistent(_))
        ));
        assert!(matches!(
            dataset.append(&[episode(1, 1)]),
            Err(DatasetError::Inconsistent(_))
        ));
        assert_eq!(dataset.episodes().len(), 1);
    }

    #[test]
    fn test_empty_append_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut dataset = Dataset::open(dir.path().join("ds"), 60.0, OBSERVATION_DIM).unwrap();
        dataset.append(&[]).unwrap();
        assert!(!dataset.data_path().exists());
        assert!(dataset.load_frames().unwrap().is_empty());
    }
}
