//! Scalar metric log, one `tag,step,value` row per measurement

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::training::EpochReport;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRow {
    pub tag: String,
    pub step: usize,
    pub value: f64,
}

/// Append-only CSV of scalars, flushed after every epoch
pub struct ScalarLog {
    writer: csv::Writer<File>,
    path: PathBuf,
}

impl ScalarLog {
    pub const FILE_NAME: &'static str = "scalars.csv";

    /// Create `<dir>/scalars.csv`, creating `dir` if needed
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        let writer = csv::Writer::from_path(&path)?;
        log::info!("Logging scalars at {}", path.display());
        Ok(ScalarLog { writer, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_scalar(&mut self, tag: &str, step: usize, value: f64) -> Result<()> {
        self.writer.serialize(ScalarRow {
            tag: tag.to_string(),
            step,
            value,
        })?;
        Ok(())
    }

    /// Write every scalar of one epoch
    pub fn log_epoch(&mut self, report: &EpochReport) -> Result<()> {
        let epoch = report.epoch;
        self.add_scalar("Train_Loss", epoch, report.train.avg_loss())?;
        self.add_scalar("Train_Reconstruction", epoch, report.train.avg_reconstruction())?;
        self.add_scalar("Train_Regularizer", epoch, report.train.avg_regularizer())?;
        self.add_scalar("Train_MSE", epoch, report.train.avg_mse())?;
        self.add_scalar("Annealing_Weight", epoch, report.annealing_weight)?;
        self.add_scalar("Learning_Rate", epoch, report.learning_rate)?;
        if let Some(test) = &report.test {
            self.add_scalar("Test_Loss", epoch, test.avg_reconstruction())?;
            self.add_scalar("Test_MSE", epoch, test.avg_mse())?;
            self.add_scalar("Test_MAE", epoch, test.avg_mae())?;
        }
        self.writer.flush()?;
        Ok(())
    }

    /// Read a scalar log back
    pub fn read(path: impl AsRef<Path>) -> Result<Vec<ScalarRow>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::EpochMetrics;

    #[test]
    fn test_epoch_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = ScalarLog::create(dir.path().join("runs")).unwrap();

        let mut train = EpochMetrics::new();
        train.update(0.5, 0.4, 0.1, 0.4, 2.0, 3);
        let report = EpochReport {
            epoch: 0,
            train: train.clone(),
            test: Some(train),
            annealing_weight: 0.0,
            learning_rate: 1e-3,
            global_step: 1,
        };
        log.log_epoch(&report).unwrap();
        log.log_epoch(&EpochReport {
            epoch: 1,
            test: None,
            ..report
        })
        .unwrap();

        let rows = ScalarLog::read(log.path()).unwrap();
        assert_eq!(rows.len(), 9 + 6);
        assert_eq!(rows[0].tag, "Train_Loss");
        assert!(rows.iter().filter(|r| r.tag == "Test_MSE").all(|r| r.step == 0));
    }
}
