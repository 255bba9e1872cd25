// src/database.rs

//! Persistence of failing trials so they can be replayed.
//!
//! The database is a single file holding the list of recorded
//! [`TrialParams`], encoded with bincode's standard configuration. A missing
//! file is an empty database.

use std::env;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use bincode::config;
use log::{error, info, trace};

use crate::check::Tolerances;
use crate::device::DeviceOption;
use crate::error::CheckError;
use crate::trial::{run_trial, TrialParams};

#[derive(Debug, Clone)]
pub struct TrialDatabase {
    path: PathBuf,
}

impl TrialDatabase {
    pub fn open(path: impl AsRef<Path>) -> Self {
        TrialDatabase {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Opens the database named by the environment variable `var`, falling
    /// back to `default` when it is unset or empty.
    pub fn from_env(var: &str, default: impl AsRef<Path>) -> Self {
        match env::var_os(var) {
            Some(path) if !path.is_empty() => Self::open(path),
            _ => Self::open(default),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All recorded trials, oldest first.
    pub fn load(&self) -> Result<Vec<TrialParams>, CheckError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!("No trial database at {:?}", self.path);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let trials: Vec<TrialParams> =
            bincode::serde::decode_from_std_read(&mut reader, config::standard())?;
        trace!("Loaded {} trial(s) from {:?}", trials.len(), self.path);
        Ok(trials)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Replaces the file contents. The new list is written to a sibling file
    /// first and renamed over the old one, so readers never see a partial
    /// write.
    fn write(&self, trials: &[TrialParams]) -> Result<(), CheckError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let temp = self.temp_path();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)?;
        let mut writer = BufWriter::new(file);
        let _: usize =
            bincode::serde::encode_into_std_write(trials, &mut writer, config::standard())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        fs::rename(&temp, &self.path)?;
        trace!("Wrote {} trial(s) to {:?}", trials.len(), self.path);
        Ok(())
    }

    /// Records a trial. Returns false if it was already recorded.
    pub fn record(&self, params: &TrialParams) -> Result<bool, CheckError> {
        let mut trials = self.load()?;
        if trials.contains(params) {
            return Ok(false);
        }
        trials.push(*params);
        self.write(&trials)?;
        info!("Recorded failing trial {:?} in {:?}", params, self.path);
        Ok(true)
    }

    /// Removes a recorded trial. Returns false if it was not recorded.
    pub fn forget(&self, params: &TrialParams) -> Result<bool, CheckError> {
        let mut trials = self.load()?;
        let before = trials.len();
        trials.retain(|t| t != params);
        if trials.len() == before {
            return Ok(false);
        }
        self.write(&trials)?;
        Ok(true)
    }

    pub fn clear(&self) -> Result<(), CheckError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs a trial and records it if any check fails.
    pub fn check(
        &self,
        params: &TrialParams,
        gc: DeviceOption,
        dc: &[DeviceOption],
        tolerances: &Tolerances,
    ) -> Result<(), CheckError> {
        let result = run_trial(params, gc, dc, tolerances);
        if let Err(e) = &result {
            if e.is_mismatch() {
                self.record(params)?;
            }
        }
        result
    }

    /// Reruns every recorded trial, stopping at the first failure. Trials
    /// that now pass are dropped from the database.
    ///
    /// Returns the number of trials replayed.
    pub fn replay(
        &self,
        gc: DeviceOption,
        dc: &[DeviceOption],
        tolerances: &Tolerances,
    ) -> Result<usize, CheckError> {
        let trials = self.load()?;
        info!("Replaying {} recorded trial(s)", trials.len());
        for params in &trials {
            if let Err(e) = run_trial(params, gc, dc, tolerances) {
                error!("Recorded trial {:?} still fails: {}", params, e);
                return Err(e);
            }
            self.forget(params)?;
        }
        Ok(trials.len())
    }
}

// -------------------- Tests --------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::GradientTolerance;
    use crate::error::CheckKind;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty() -> Result<(), CheckError> {
        let dir = tempdir()?;
        let db = TrialDatabase::open(dir.path().join("trials.bin"));
        assert!(db.load()?.is_empty());
        db.clear()?;
        Ok(())
    }

    #[test]
    fn test_record_load_forget() -> Result<(), CheckError> {
        let dir = tempdir()?;
        let db = TrialDatabase::open(dir.path().join("trials.bin"));
        let a = TrialParams::new(10, 1, 0.25);
        let b = TrialParams::new(20, 65535, -0.5);

        assert!(db.record(&a)?);
        assert!(db.record(&b)?);
        assert!(!db.record(&a)?, "Duplicate trial should not be recorded twice");
        assert_eq!(db.load()?, vec![a, b]);

        assert!(db.forget(&a)?);
        assert!(!db.forget(&a)?);
        assert_eq!(db.load()?, vec![b]);

        db.clear()?;
        assert!(db.load()?.is_empty());
        assert!(!db.path().exists());
        Ok(())
    }

    #[test]
    fn test_failed_write_keeps_previous_contents() -> Result<(), CheckError> {
        let dir = tempdir()?;
        let db = TrialDatabase::open(dir.path().join("trials.bin"));
        let a = TrialParams::new(10, 1, 0.25);
        assert!(db.record(&a)?);

        // A directory in the way of the temporary file makes the write fail
        // before anything is renamed.
        fs::create_dir(db.temp_path())?;
        let b = TrialParams::new(11, 2, -0.25);
        assert!(matches!(db.record(&b), Err(CheckError::IoError(_))));
        assert_eq!(db.load()?, vec![a]);

        fs::remove_dir(db.temp_path())?;
        assert!(db.record(&b)?);
        assert_eq!(db.load()?, vec![a, b]);
        assert!(!db.temp_path().exists());
        Ok(())
    }

    #[test]
    fn test_from_env_falls_back_to_default() -> Result<(), CheckError> {
        let dir = tempdir()?;
        let default = dir.path().join("nested").join("trials.bin");
        let db = TrialDatabase::from_env("OPCHECK_TEST_UNSET_TRIAL_DB", &default);
        assert_eq!(db.path(), default.as_path());

        // Missing parent directories are created on first write.
        assert!(db.record(&TrialParams::new(10, 3, 0.0))?);
        assert!(default.exists());
        Ok(())
    }

    #[test]
    fn test_corrupt_file() -> Result<(), CheckError> {
        let dir = tempdir()?;
        let path = dir.path().join("trials.bin");
        fs::write(&path, [0xffu8; 3])?;
        let db = TrialDatabase::open(&path);
        assert!(matches!(
            db.load(),
            Err(CheckError::BincodeDecodeError(_))
        ));
        Ok(())
    }

    #[test]
    fn test_check_records_failures_and_replay() -> Result<(), CheckError> {
        let dir = tempdir()?;
        let db = TrialDatabase::open(dir.path().join("trials.bin"));
        let cpu = DeviceOption::cpu();
        let params = TrialParams::new(12, 99, 0.1);

        // A negative threshold can never be met, so the gradient check fails.
        let impossible = Tolerances {
            gradient: GradientTolerance {
                threshold: -1.0,
                ..GradientTolerance::default()
            },
            ..Tolerances::default()
        };
        let err = db.check(&params, cpu, &[cpu], &impossible).unwrap_err();
        assert!(matches!(
            err,
            CheckError::Mismatch {
                check: CheckKind::Gradient,
                ..
            }
        ));
        assert_eq!(db.load()?, vec![params]);
        assert!(db.replay(cpu, &[cpu], &impossible).is_err());
        assert_eq!(db.load()?, vec![params], "Still-failing trial must be kept");

        // With the default tolerances the recorded trial passes and is dropped.
        assert_eq!(db.replay(cpu, &[cpu], &Tolerances::default())?, 1);
        assert!(db.load()?.is_empty());

        db.check(&params, cpu, &[cpu], &Tolerances::default())?;
        assert!(db.load()?.is_empty());
        Ok(())
    }
}
