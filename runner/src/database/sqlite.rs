use super::{
    sample_luminosity, ConnectionError, Dataset, FileRecord, NewDataset, NewFile, Sample,
    SampleDraft, SaveOutcome, ID, SQL_SCHEMA, SQL_SCHEMA_NUMBER,
};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::{path::Path, sync::Arc};
use tracing::{debug, error, info};
use tracing_unwrap::ResultExt;

const DATASET_COLUMNS: &str = "dataset_id, name, process, nevents, xsection, datatype, user_comment";
const SAMPLE_COLUMNS: &str = "sample_id, name, path, sampletype, nevents_processed, nevents,
    normalization, event_weight_sum, extras_event_weight_sum, luminosity, processed_lumi,
    code_version, user_comment, author, creation_time, source_dataset_id, source_sample_id";

#[derive(Debug, Clone)]
/// Transparent, thread safe wrapper over `InnerConnection`
pub struct SharedConnection(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
}

impl From<rusqlite::Error> for ConnectionError {
    fn from(error: rusqlite::Error) -> Self {
        ConnectionError::SQLite(error)
    }
}

fn dataset_from_row(row: &Row) -> rusqlite::Result<Dataset> {
    Ok(Dataset {
        dataset_id: row.get(0)?,
        name: row.get(1)?,
        process: row.get(2)?,
        nevents: row.get(3)?,
        xsection: row.get(4)?,
        datatype: row.get(5)?,
        user_comment: row.get(6)?,
    })
}

fn sample_from_row(row: &Row) -> rusqlite::Result<Sample> {
    Ok(Sample {
        sample_id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        sampletype: row.get(3)?,
        nevents_processed: row.get(4)?,
        nevents: row.get(5)?,
        normalization: row.get(6)?,
        event_weight_sum: row.get(7)?,
        extras_event_weight_sum: row.get(8)?,
        luminosity: row.get(9)?,
        processed_lumi: row.get(10)?,
        code_version: row.get(11)?,
        user_comment: row.get(12)?,
        author: row.get(13)?,
        creation_time: row.get(14)?,
        source_dataset_id: row.get(15)?,
        source_sample_id: row.get(16)?,
    })
}

fn file_from_row(row: &Row) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        file_id: row.get(0)?,
        sample_id: row.get(1)?,
        lfn: row.get(2)?,
        pfn: row.get(3)?,
        event_weight_sum: row.get(4)?,
        extras_event_weight_sum: row.get(5)?,
        nevents: row.get(6)?,
    })
}

impl SharedConnection {
    pub fn new(inner_connection: InnerConnection) -> Self {
        Self(Arc::new(FairMutex::new(inner_connection)))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    /// Open (or create) the database at `path` and apply the schema
    pub fn load(path: &Path) -> Result<Self, ConnectionError> {
        Ok(Self::new(InnerConnection::load(path)?))
    }

    pub fn open_in_memory() -> Result<Self, ConnectionError> {
        Ok(Self::new(InnerConnection::open_in_memory()?))
    }

    pub fn close(self) -> Result<(), ConnectionError> {
        Arc::try_unwrap(self.0).unwrap_or_log().into_inner().close()
    }

    pub fn find_datasets_by_name(&self, name: &str) -> Result<Vec<Dataset>, ConnectionError> {
        self.lock().find_datasets_by_name(name)
    }

    pub fn find_dataset(&self, id: ID) -> Result<Option<Dataset>, ConnectionError> {
        self.lock().find_dataset(id)
    }

    pub fn insert_dataset(&self, dataset: &NewDataset) -> Result<ID, ConnectionError> {
        self.lock().insert_dataset(dataset)
    }

    pub fn find_sample_by_name(&self, name: &str) -> Result<Option<Sample>, ConnectionError> {
        self.lock().find_sample_by_name(name)
    }

    pub fn find_sample(&self, id: ID) -> Result<Option<Sample>, ConnectionError> {
        self.lock().find_sample(id)
    }

    pub fn samples(&self) -> Result<Vec<Sample>, ConnectionError> {
        self.lock().samples()
    }

    pub fn files_for_sample(&self, id: ID) -> Result<Vec<FileRecord>, ConnectionError> {
        self.lock().files_for_sample(id)
    }

    pub fn save_sample(&self, draft: &SampleDraft) -> Result<SaveOutcome, ConnectionError> {
        self.lock().save_sample(draft)
    }

    pub fn remove_sample(&self, id: ID) -> Result<(), ConnectionError> {
        self.lock().remove_sample(id)
    }

    pub fn count_derived_samples(&self, id: ID) -> Result<u64, ConnectionError> {
        self.lock().count_derived_samples(id)
    }

    pub fn count_results(&self, id: ID) -> Result<u64, ConnectionError> {
        self.lock().count_results(id)
    }

    pub fn add_result(&self, sample_id: ID, path: &str, description: &str) -> Result<ID, ConnectionError> {
        self.lock().add_result(sample_id, path, description)
    }
}

impl InnerConnection {
    fn init(connection: Connection) -> Result<Self, ConnectionError> {
        connection.pragma_update(None, "foreign_keys", true)?;

        let mut counter = 1;

        for table in SQL_SCHEMA {
            match connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(ConnectionError::SQLite(error));
                }
            };

            counter += 1;
        }

        Ok(Self { connection })
    }

    pub fn load(path: &Path) -> Result<Self, ConnectionError> {
        info!(path = ?path, "Opening SQLite database");

        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, ConnectionError> {
        Self::init(Connection::open_in_memory()?)
    }

    pub fn close(mut self) -> Result<(), ConnectionError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                error!("Failed to close connection, giving up");

                return Err(ConnectionError::SQLite(error));
            }
        }

        debug!("Closed SQLite connection");

        Ok(())
    }

    pub fn find_datasets_by_name(&self, name: &str) -> Result<Vec<Dataset>, ConnectionError> {
        self.connection
            .prepare_cached(&format!("select {DATASET_COLUMNS} from datasets where name = ?"))?
            .query_map(params![name], dataset_from_row)?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<Dataset>, ConnectionError>(init)
            })
    }

    pub fn find_dataset(&self, id: ID) -> Result<Option<Dataset>, ConnectionError> {
        Ok(self
            .connection
            .prepare_cached(&format!(
                "select {DATASET_COLUMNS} from datasets where dataset_id = ?"
            ))?
            .query_row(params![id], dataset_from_row)
            .optional()?)
    }

    pub fn insert_dataset(&self, dataset: &NewDataset) -> Result<ID, ConnectionError> {
        let id = self
            .connection
            .prepare_cached(
                "insert into datasets
                 (name, process, nevents, xsection, datatype, user_comment)
                 values (?, ?, ?, ?, ?, ?) returning dataset_id",
            )?
            .query_row(
                params![
                    dataset.name,
                    dataset.process,
                    dataset.nevents,
                    dataset.xsection,
                    dataset.datatype,
                    dataset.user_comment
                ],
                |row| row.get(0),
            )?;

        info!(id = id, name = %dataset.name, "Created dataset entry");

        Ok(id)
    }

    pub fn find_sample_by_name(&self, name: &str) -> Result<Option<Sample>, ConnectionError> {
        Ok(self
            .connection
            .prepare_cached(&format!("select {SAMPLE_COLUMNS} from samples where name = ?"))?
            .query_row(params![name], sample_from_row)
            .optional()?)
    }

    pub fn find_sample(&self, id: ID) -> Result<Option<Sample>, ConnectionError> {
        Ok(self
            .connection
            .prepare_cached(&format!(
                "select {SAMPLE_COLUMNS} from samples where sample_id = ?"
            ))?
            .query_row(params![id], sample_from_row)
            .optional()?)
    }

    pub fn samples(&self) -> Result<Vec<Sample>, ConnectionError> {
        self.connection
            .prepare_cached(&format!("select {SAMPLE_COLUMNS} from samples order by sample_id"))?
            .query_map(params![], sample_from_row)?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<Sample>, ConnectionError>(init)
            })
    }

    pub fn files_for_sample(&self, id: ID) -> Result<Vec<FileRecord>, ConnectionError> {
        self.connection
            .prepare_cached(
                "select file_id, sample_id, lfn, pfn, event_weight_sum, extras_event_weight_sum, nevents
                 from files where sample_id = ? order by file_id",
            )?
            .query_map(params![id], file_from_row)?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<FileRecord>, ConnectionError>(init)
            })
    }

    /// Create the sample, or replace the files and fields of the sample with the same name
    pub fn save_sample(&self, draft: &SampleDraft) -> Result<SaveOutcome, ConnectionError> {
        let extras = serde_json::to_string(&draft.extras_event_weight_sum).map_err(|source| {
            ConnectionError::Json {
                column: "extras_event_weight_sum",
                source,
            }
        })?;
        let processed_lumi = draft
            .processed_lumi
            .as_ref()
            .filter(|mask| !mask.is_empty())
            .map(|mask| mask.to_json())
            .transpose()
            .map_err(|source| ConnectionError::Json {
                column: "processed_lumi",
                source,
            })?;

        // NOTE: We can guarantee that no nested transactions are present due to only having one
        // connection at a time.
        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        let dataset = tx
            .prepare_cached(&format!(
                "select {DATASET_COLUMNS} from datasets where dataset_id = ?"
            ))?
            .query_row(params![draft.source_dataset_id], dataset_from_row)
            .optional()?
            .ok_or(ConnectionError::UnknownDataset(draft.source_dataset_id))?;
        let luminosity = sample_luminosity(&dataset, draft.nevents_processed, draft.event_weight_sum);

        let existing: Option<ID> = tx
            .prepare_cached("select sample_id from samples where name = ?")?
            .query_row(params![draft.name], |row| row.get(0))
            .optional()?;

        let outcome = match existing {
            Some(id) => {
                tx.prepare_cached("delete from files where sample_id = ?")?
                    .execute(params![id])?;
                tx.prepare_cached(
                    "update samples set
                     path = ?, sampletype = ?, nevents_processed = ?, nevents = ?,
                     normalization = ?, event_weight_sum = ?, extras_event_weight_sum = ?,
                     luminosity = ?, processed_lumi = ?, code_version = ?, user_comment = ?,
                     author = ?, source_dataset_id = ?, source_sample_id = ?
                     where sample_id = ?",
                )?
                .execute(params![
                    draft.path,
                    draft.sampletype,
                    draft.nevents_processed,
                    draft.nevents,
                    draft.normalization,
                    draft.event_weight_sum,
                    extras,
                    luminosity,
                    processed_lumi,
                    draft.code_version,
                    draft.user_comment,
                    draft.author,
                    draft.source_dataset_id,
                    draft.source_sample_id,
                    id
                ])?;

                SaveOutcome::Updated(id)
            }
            None => {
                let creation_time = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
                let id = tx
                    .prepare_cached(
                        "insert into samples
                         (name, path, sampletype, nevents_processed, nevents, normalization,
                          event_weight_sum, extras_event_weight_sum, luminosity, processed_lumi,
                          code_version, user_comment, author, creation_time,
                          source_dataset_id, source_sample_id)
                         values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                         returning sample_id",
                    )?
                    .query_row(
                        params![
                            draft.name,
                            draft.path,
                            draft.sampletype,
                            draft.nevents_processed,
                            draft.nevents,
                            draft.normalization,
                            draft.event_weight_sum,
                            extras,
                            luminosity,
                            processed_lumi,
                            draft.code_version,
                            draft.user_comment,
                            draft.author,
                            creation_time,
                            draft.source_dataset_id,
                            draft.source_sample_id
                        ],
                        |row| row.get(0),
                    )?;

                SaveOutcome::Created(id)
            }
        };

        let sample_id = outcome.id();
        draft.files.iter().try_for_each(|file: &NewFile| -> Result<(), ConnectionError> {
            tx.prepare_cached(
                "insert into files
                 (sample_id, lfn, pfn, event_weight_sum, extras_event_weight_sum, nevents)
                 values (?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                sample_id,
                file.lfn,
                file.pfn,
                file.event_weight_sum,
                file.extras_event_weight_sum,
                file.nevents
            ])?;

            Ok(())
        })?;
        tx.commit()?;

        info!(
            id = sample_id,
            name = %draft.name,
            files = draft.files.len(),
            "Stored sample"
        );

        Ok(outcome)
    }

    pub fn remove_sample(&self, id: ID) -> Result<(), ConnectionError> {
        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        tx.prepare_cached("delete from files where sample_id = ?")?
            .execute(params![id])?;
        let removed = tx
            .prepare_cached("delete from samples where sample_id = ?")?
            .execute(params![id])?;

        if removed == 0 {
            return Err(ConnectionError::UnknownSample(id));
        }

        tx.commit()?;
        info!(id = id, "Removed sample");

        Ok(())
    }

    pub fn count_derived_samples(&self, id: ID) -> Result<u64, ConnectionError> {
        Ok(self
            .connection
            .prepare_cached("select count(*) from samples where source_sample_id = ?")?
            .query_row(params![id], |row| row.get(0))?)
    }

    pub fn count_results(&self, id: ID) -> Result<u64, ConnectionError> {
        Ok(self
            .connection
            .prepare_cached("select count(*) from results where sample_id = ?")?
            .query_row(params![id], |row| row.get(0))?)
    }

    pub fn add_result(&self, sample_id: ID, path: &str, description: &str) -> Result<ID, ConnectionError> {
        Ok(self
            .connection
            .prepare_cached(
                "insert into results (sample_id, path, description)
                 values (?, ?, ?) returning result_id",
            )?
            .query_row(params![sample_id, path, description], |row| row.get(0))?)
    }
}
