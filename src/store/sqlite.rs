//! SQLite-backed test store
//!
//! One table keyed by `qr_code_hash`, with explicit columns for every
//! lifecycle field. Family-only columns are nullable and ignored for
//! single-user rows.

use crate::model::{AntigenTest, CoronaTest, FamilyMemberTest, PcrTest, TestCommon, TestResult};
use crate::store::{StoredTest, TestStore};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;

/// SQLite-backed store for the tracked-test set
pub struct SqliteTestStore {
    /// SQLite connection; rusqlite connections are not Sync
    conn: Mutex<Connection>,
}

impl SqliteTestStore {
    /// Create a store with a database file
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory store (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS corona_test (
                qr_code_hash TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                test_type TEXT NOT NULL,
                display_name TEXT,
                registration_date INTEGER NOT NULL,
                registration_token TEXT,
                test_result INTEGER NOT NULL,
                final_result_received_at INTEGER,
                submission_consent INTEGER NOT NULL,
                certificate_consent INTEGER NOT NULL,
                certificate_requested INTEGER NOT NULL,
                certificate_identifier TEXT,
                submission_tan TEXT,
                keys_submitted INTEGER NOT NULL,
                lab_id TEXT,
                poc_consent_date INTEGER,
                sample_collection_date INTEGER,
                is_outdated INTEGER NOT NULL DEFAULT 0,
                is_new INTEGER NOT NULL DEFAULT 0,
                test_result_is_new INTEGER NOT NULL DEFAULT 0,
                certificate_supported_by_poc INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("database mutex poisoned".to_string()))
    }
}

impl TestStore for SqliteTestStore {
    fn load(&self) -> Result<Vec<StoredTest>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT qr_code_hash, scope, test_type, display_name, registration_date,
                    registration_token, test_result, final_result_received_at,
                    submission_consent, certificate_consent, certificate_requested,
                    certificate_identifier, submission_tan, keys_submitted, lab_id,
                    poc_consent_date, sample_collection_date, is_outdated,
                    is_new, test_result_is_new, certificate_supported_by_poc
             FROM corona_test
             ORDER BY registration_date ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(TestRow {
                qr_code_hash: row.get(0)?,
                scope: row.get(1)?,
                test_type: row.get(2)?,
                display_name: row.get(3)?,
                registration_date: row.get(4)?,
                registration_token: row.get(5)?,
                test_result: row.get(6)?,
                final_result_received_at: row.get(7)?,
                submission_consent: row.get(8)?,
                certificate_consent: row.get(9)?,
                certificate_requested: row.get(10)?,
                certificate_identifier: row.get(11)?,
                submission_tan: row.get(12)?,
                keys_submitted: row.get(13)?,
                lab_id: row.get(14)?,
                poc_consent_date: row.get(15)?,
                sample_collection_date: row.get(16)?,
                is_outdated: row.get(17)?,
                is_new: row.get(18)?,
                test_result_is_new: row.get(19)?,
                certificate_supported_by_poc: row.get(20)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(entry_from_row(row?)?);
        }

        Ok(entries)
    }

    fn upsert(&self, entry: &StoredTest) -> Result<()> {
        let (scope, display_name, is_new, test_result_is_new, certificate_supported_by_poc, test) =
            match entry {
                StoredTest::User(test) => ("user", None, false, false, false, test),
                StoredTest::Family(member) => (
                    "family",
                    Some(member.display_name.as_str()),
                    member.is_new,
                    member.test_result_is_new,
                    member.certificate_supported_by_point_of_care,
                    &member.test,
                ),
            };

        let (test_type, poc_consent_date, sample_collection_date, is_outdated) = match test {
            CoronaTest::Pcr(_) => ("pcr", None, None, false),
            CoronaTest::Antigen(t) => (
                "antigen",
                Some(t.point_of_care_consent_date.timestamp_millis()),
                t.sample_collection_date.map(|d| d.timestamp_millis()),
                t.is_outdated,
            ),
        };

        let common = test.common();
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO corona_test
             (qr_code_hash, scope, test_type, display_name, registration_date,
              registration_token, test_result, final_result_received_at,
              submission_consent, certificate_consent, certificate_requested,
              certificate_identifier, submission_tan, keys_submitted, lab_id,
              poc_consent_date, sample_collection_date, is_outdated,
              is_new, test_result_is_new, certificate_supported_by_poc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                     ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            params![
                common.qr_code_hash,
                scope,
                test_type,
                display_name,
                common.registration_date.timestamp_millis(),
                common.registration_token,
                common.test_result.as_i64(),
                common
                    .final_test_result_received_date
                    .map(|d| d.timestamp_millis()),
                common.submission_consent,
                common.certificate_consent,
                common.certificate_requested,
                common.unique_certificate_identifier,
                common.submission_tan,
                common.keys_submitted,
                common.lab_id,
                poc_consent_date,
                sample_collection_date,
                is_outdated,
                is_new,
                test_result_is_new,
                certificate_supported_by_poc,
            ],
        )?;

        Ok(())
    }

    fn remove(&self, qr_code_hash: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM corona_test WHERE qr_code_hash = ?1",
            params![qr_code_hash],
        )?;
        Ok(())
    }
}

/// Raw column values of one corona_test row
struct TestRow {
    qr_code_hash: String,
    scope: String,
    test_type: String,
    display_name: Option<String>,
    registration_date: i64,
    registration_token: Option<String>,
    test_result: i64,
    final_result_received_at: Option<i64>,
    submission_consent: bool,
    certificate_consent: bool,
    certificate_requested: bool,
    certificate_identifier: Option<String>,
    submission_tan: Option<String>,
    keys_submitted: bool,
    lab_id: Option<String>,
    poc_consent_date: Option<i64>,
    sample_collection_date: Option<i64>,
    is_outdated: bool,
    is_new: bool,
    test_result_is_new: bool,
    certificate_supported_by_poc: bool,
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Storage(format!("Invalid stored timestamp: {}", ms)))
}

fn entry_from_row(row: TestRow) -> Result<StoredTest> {
    let test_result = TestResult::from_i64(row.test_result)
        .ok_or_else(|| Error::Storage(format!("Unknown stored test result: {}", row.test_result)))?;

    let common = TestCommon {
        registration_date: millis_to_datetime(row.registration_date)?,
        registration_token: row.registration_token,
        qr_code_hash: row.qr_code_hash,
        test_result,
        final_test_result_received_date: row
            .final_result_received_at
            .map(millis_to_datetime)
            .transpose()?,
        submission_consent: row.submission_consent,
        certificate_consent: row.certificate_consent,
        certificate_requested: row.certificate_requested,
        unique_certificate_identifier: row.certificate_identifier,
        submission_tan: row.submission_tan,
        keys_submitted: row.keys_submitted,
        lab_id: row.lab_id,
    };

    let test = match row.test_type.as_str() {
        "pcr" => CoronaTest::Pcr(PcrTest { common }),
        "antigen" => {
            let poc = row.poc_consent_date.ok_or_else(|| {
                Error::Storage("Antigen row without point-of-care consent date".to_string())
            })?;
            CoronaTest::Antigen(AntigenTest {
                common,
                point_of_care_consent_date: millis_to_datetime(poc)?,
                sample_collection_date: row
                    .sample_collection_date
                    .map(millis_to_datetime)
                    .transpose()?,
                is_outdated: row.is_outdated,
            })
        }
        other => {
            return Err(Error::Storage(format!("Unknown stored test type: {}", other)));
        }
    };

    match row.scope.as_str() {
        "user" => Ok(StoredTest::User(test)),
        "family" => Ok(StoredTest::Family(FamilyMemberTest {
            display_name: row.display_name.unwrap_or_default(),
            test,
            is_new: row.is_new,
            test_result_is_new: row.test_result_is_new,
            certificate_supported_by_point_of_care: row.certificate_supported_by_poc,
        })),
        other => Err(Error::Storage(format!("Unknown stored scope: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::hash_qr_payload;
    use chrono::Duration;

    fn sample_pcr() -> CoronaTest {
        let mut test = CoronaTest::pcr(
            hash_qr_payload("guid-1"),
            "token-1".to_string(),
            Utc::now(),
            true,
            true,
        );
        test.apply_result(TestResult::Positive, Utc::now());
        test.set_lab_id("lab-7".to_string());
        test
    }

    fn sample_family_antigen() -> FamilyMemberTest {
        let mut test = CoronaTest::antigen(
            hash_qr_payload("guid-2"),
            "token-2".to_string(),
            Utc::now(),
            Utc::now() - Duration::hours(2),
            false,
            true,
        );
        test.apply_result(TestResult::Negative, Utc::now());
        test.set_outdated(true);
        FamilyMemberTest::new("Alex".to_string(), test, true)
    }

    #[test]
    fn test_user_round_trip() {
        let store = SqliteTestStore::new_in_memory().expect("Failed to create store");
        let entry = StoredTest::User(sample_pcr());
        store.upsert(&entry).expect("Failed to upsert");

        let loaded = store.load().expect("Failed to load");
        assert_eq!(loaded.len(), 1);
        match &loaded[0] {
            StoredTest::User(test) => {
                assert_eq!(test.test_result(), TestResult::Positive);
                assert_eq!(test.lab_id(), Some("lab-7"));
                assert!(test.final_test_result_received_date().is_some());
                assert_eq!(test.qr_code_hash(), entry.qr_code_hash());
            }
            other => panic!("Expected User entry, got {:?}", other),
        }
    }

    #[test]
    fn test_family_round_trip() {
        let store = SqliteTestStore::new_in_memory().expect("Failed to create store");
        let entry = StoredTest::Family(sample_family_antigen());
        store.upsert(&entry).expect("Failed to upsert");

        let loaded = store.load().expect("Failed to load");
        assert_eq!(loaded.len(), 1);
        match &loaded[0] {
            StoredTest::Family(member) => {
                assert_eq!(member.display_name, "Alex");
                assert!(member.is_new);
                assert!(member.certificate_supported_by_point_of_care);
                assert!(member.test.is_outdated());
                assert_eq!(member.test.test_result(), TestResult::Negative);
            }
            other => panic!("Expected Family entry, got {:?}", other),
        }
    }

    #[test]
    fn test_upsert_replaces_and_remove_deletes() {
        let store = SqliteTestStore::new_in_memory().expect("Failed to create store");
        let mut test = sample_pcr();
        store
            .upsert(&StoredTest::User(test.clone()))
            .expect("Failed to upsert");

        test.redeem_token_for_tan("tan-1".to_string());
        store
            .upsert(&StoredTest::User(test.clone()))
            .expect("Failed to upsert");

        let loaded = store.load().expect("Failed to load");
        assert_eq!(loaded.len(), 1);
        match &loaded[0] {
            StoredTest::User(t) => {
                assert_eq!(t.submission_tan(), Some("tan-1"));
                assert_eq!(t.registration_token(), None);
            }
            other => panic!("Expected User entry, got {:?}", other),
        }

        store
            .remove(test.qr_code_hash())
            .expect("Failed to remove");
        assert!(store.load().expect("Failed to load").is_empty());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("Failed to create tempdir");
        let path = dir.path().join("tests.db");

        {
            let store = SqliteTestStore::new(&path).expect("Failed to create store");
            store
                .upsert(&StoredTest::User(sample_pcr()))
                .expect("Failed to upsert");
        }

        let store = SqliteTestStore::new(&path).expect("Failed to reopen store");
        assert_eq!(store.load().expect("Failed to load").len(), 1);
    }
}
