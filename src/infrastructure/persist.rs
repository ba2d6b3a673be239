use crate::domain::Pledge;
use crate::foundation::constants::PLEDGE_FILE_EXTENSION;
use crate::foundation::Result;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

/// Persist a pledge as `<sha256>.pledge` in `dir`, via a temp file and
/// rename so a partially written pledge is never visible to the watcher.
pub fn save_pledge(dir: &Path, pledge: &Pledge) -> Result<PathBuf> {
    let bytes = pledge.to_bytes()?;
    let filename = format!("{}.{}", pledge.hash(), PLEDGE_FILE_EXTENSION);
    fs::create_dir_all(dir)?;
    let tmp_path = dir.join(format!("{filename}.tmp"));
    fs::write(&tmp_path, &bytes)?;
    let final_path = dir.join(filename);
    info!("saving pledge to disk as {}", final_path.display());
    fs::rename(&tmp_path, &final_path)?;
    Ok(final_path)
}

pub fn load_pledge(path: &Path) -> Result<Pledge> {
    let bytes = fs::read(path)?;
    Pledge::from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::ProjectId;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

    fn pledge() -> Pledge {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([1; 32]), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: Amount::from_sat(1_000), script_pubkey: ScriptBuf::new() }],
        };
        Pledge::new(ProjectId::new([7; 32]), vec![], tx, Amount::from_sat(1_000))
    }

    #[test]
    fn saved_pledge_round_trips_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pledge = pledge();

        let path = save_pledge(dir.path(), &pledge).expect("save");
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some(format!("{}.pledge", pledge.hash()).as_str()));

        let loaded = load_pledge(&path).expect("load");
        assert_eq!(loaded, pledge);

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
