use crate::data::Cohort;
use crate::error::{ExperimentError, Result};
use csv::ReaderBuilder;
use flate2::read::GzDecoder;
use ndarray::{Array2, Array3};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info};

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileFormat {
    Csv,
    Tsv,
    GzippedCsv,
    GzippedTsv,
}

impl FileFormat {
    /// Detect file format from path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str());
        let stem = path.file_stem().and_then(|s| s.to_str());

        match (ext, stem) {
            (Some("gz"), Some(stem)) => {
                if stem.ends_with(".csv") {
                    Ok(FileFormat::GzippedCsv)
                } else if stem.ends_with(".tsv") || stem.ends_with(".txt") {
                    Ok(FileFormat::GzippedTsv)
                } else {
                    Err(ExperimentError::config(format!(
                        "cannot determine format of gzipped file {:?}",
                        path
                    )))
                }
            }
            (Some("csv"), _) => Ok(FileFormat::Csv),
            (Some("tsv"), _) | (Some("txt"), _) => Ok(FileFormat::Tsv),
            _ => Err(ExperimentError::config(format!("unsupported file format: {:?}", path))),
        }
    }

    /// Get delimiter character
    pub fn delimiter(&self) -> u8 {
        match self {
            FileFormat::Csv | FileFormat::GzippedCsv => b',',
            FileFormat::Tsv | FileFormat::GzippedTsv => b'\t',
        }
    }

    /// Check if format is gzipped
    pub fn is_gzipped(&self) -> bool {
        matches!(self, FileFormat::GzippedCsv | FileFormat::GzippedTsv)
    }
}

/// Column names of the long visit table
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub patient_column: String,
    pub visit_column: String,
    pub outcome_column: String,
    /// Present only for survival tables
    pub time_column: Option<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            patient_column: "patient".to_string(),
            visit_column: "visit".to_string(),
            outcome_column: "label".to_string(),
            time_column: None,
        }
    }
}

impl LoaderConfig {
    /// Column layout of time-to-event tables
    pub fn survival() -> Self {
        Self {
            outcome_column: "event".to_string(),
            time_column: Some("time".to_string()),
            ..Self::default()
        }
    }
}

/// Visit table regrouped by patient
#[derive(Debug, Clone)]
pub struct VisitTable {
    pub patient_ids: Vec<String>,
    pub feature_names: Vec<String>,
    /// `[patients, visits, features]`
    pub features: Array3<f32>,
    /// `[patients, visits]`
    pub outcomes: Array2<u8>,
    /// `[patients, visits]`, survival tables only
    pub times: Option<Array2<f32>>,
}

struct VisitRow {
    visit: i64,
    outcome: u8,
    time: Option<f32>,
    features: Vec<f32>,
}

/// Loads long-format visit tables (`patient, visit, label, features...`).
///
/// Patients keep the order of their first appearance and visits are sorted by the
/// visit column. Every patient must contribute the same number of visits.
pub struct CohortLoader {
    config: LoaderConfig,
}

impl CohortLoader {
    pub fn new() -> Self {
        Self {
            config: LoaderConfig::default(),
        }
    }

    pub fn with_config(config: LoaderConfig) -> Self {
        Self { config }
    }

    /// Load a classification cohort
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<Cohort> {
        let table = self.load_table(path)?;
        Cohort::new(table.features, table.outcomes)
    }

    /// Load and regroup a visit table
    pub fn load_table<P: AsRef<Path>>(&self, path: P) -> Result<VisitTable> {
        let path = path.as_ref();
        info!("Loading visits from {:?}", path);

        let format = FileFormat::from_path(path)?;
        debug!("Detected file format: {:?}", format);

        let file = File::open(path)?;
        let table = if format.is_gzipped() {
            self.parse_table(BufReader::new(GzDecoder::new(file)), format)?
        } else {
            self.parse_table(BufReader::new(file), format)?
        };

        info!(
            "Loaded {} patients x {} visits x {} features",
            table.features.shape()[0],
            table.features.shape()[1],
            table.features.shape()[2]
        );
        Ok(table)
    }

    fn parse_table<R: Read>(&self, reader: R, format: FileFormat) -> Result<VisitTable> {
        let mut csv_reader = ReaderBuilder::new()
            .delimiter(format.delimiter())
            .has_headers(true)
            .from_reader(reader);

        let headers: Vec<String> = csv_reader.headers()?.iter().map(|s| s.trim().to_string()).collect();
        let position = |name: &str| -> Result<usize> {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| ExperimentError::config(format!("missing required column: {}", name)))
        };

        let patient_idx = position(&self.config.patient_column)?;
        let visit_idx = position(&self.config.visit_column)?;
        let outcome_idx = position(&self.config.outcome_column)?;
        let time_idx = match &self.config.time_column {
            Some(name) => Some(position(name)?),
            None => None,
        };
        let reserved = [Some(patient_idx), Some(visit_idx), Some(outcome_idx), time_idx];
        let feature_idx: Vec<usize> = (0..headers.len())
            .filter(|i| !reserved.contains(&Some(*i)))
            .collect();
        let feature_names: Vec<String> = feature_idx.iter().map(|&i| headers[i].clone()).collect();
        debug!("Feature columns: {}", feature_names.len());

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<VisitRow>> = HashMap::new();

        for (line, result) in csv_reader.records().enumerate() {
            let record = result?;
            let field = |idx: usize| record.get(idx).map(str::trim).unwrap_or("");
            let parse_f32 = |idx: usize| -> Result<f32> {
                field(idx).parse::<f32>().map_err(|_| {
                    ExperimentError::config(format!(
                        "line {}: column '{}' is not numeric: '{}'",
                        line + 2,
                        headers[idx],
                        field(idx)
                    ))
                })
            };

            let patient = field(patient_idx).to_string();
            let visit = field(visit_idx).parse::<i64>().map_err(|_| {
                ExperimentError::config(format!("line {}: invalid visit '{}'", line + 2, field(visit_idx)))
            })?;
            let outcome = match field(outcome_idx) {
                "0" | "0.0" => 0,
                "1" | "1.0" => 1,
                other => {
                    return Err(ExperimentError::config(format!(
                        "line {}: outcome '{}' is not binary",
                        line + 2,
                        other
                    )))
                }
            };
            let time = match time_idx {
                Some(idx) => Some(parse_f32(idx)?),
                None => None,
            };
            let features = feature_idx.iter().map(|&i| parse_f32(i)).collect::<Result<Vec<_>>>()?;

            if !groups.contains_key(&patient) {
                order.push(patient.clone());
            }
            groups.entry(patient).or_default().push(VisitRow {
                visit,
                outcome,
                time,
                features,
            });
        }

        let first = order
            .first()
            .ok_or_else(|| ExperimentError::config("visit table has no rows"))?;
        let visits = groups[first].len();
        let num_features = feature_names.len();
        let patients = order.len();

        let mut features = Array3::<f32>::zeros((patients, visits, num_features));
        let mut outcomes = Array2::<u8>::zeros((patients, visits));
        let mut times = time_idx.map(|_| Array2::<f32>::zeros((patients, visits)));

        for (p, id) in order.iter().enumerate() {
            let rows = groups
                .get_mut(id)
                .ok_or_else(|| ExperimentError::config(format!("patient {} vanished", id)))?;
            if rows.len() != visits {
                return Err(ExperimentError::shape(format!(
                    "patient {} has {} visits, expected {}",
                    id,
                    rows.len(),
                    visits
                )));
            }
            rows.sort_by_key(|r| r.visit);
            for (v, row) in rows.iter().enumerate() {
                for (f, &value) in row.features.iter().enumerate() {
                    features[[p, v, f]] = value;
                }
                outcomes[[p, v]] = row.outcome;
                if let (Some(times), Some(t)) = (times.as_mut(), row.time) {
                    times[[p, v]] = t;
                }
            }
        }

        Ok(VisitTable {
            patient_ids: order,
            feature_names,
            features,
            outcomes,
            times,
        })
    }
}

impl Default for CohortLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_file_format_detection() {
        assert_eq!(FileFormat::from_path("data.csv").unwrap(), FileFormat::Csv);
        assert_eq!(FileFormat::from_path("data.tsv").unwrap(), FileFormat::Tsv);
        assert_eq!(FileFormat::from_path("data.csv.gz").unwrap(), FileFormat::GzippedCsv);
        assert_eq!(FileFormat::from_path("data.tsv.gz").unwrap(), FileFormat::GzippedTsv);
        assert!(FileFormat::from_path("data.npy").is_err());
    }

    #[test]
    fn test_parse_groups_visits_by_patient() {
        let csv_data = "patient,visit,label,f1,f2\n\
                        B,1,0,1.0,2.0\n\
                        A,0,0,5.0,6.0\n\
                        B,0,1,3.0,4.0\n\
                        A,1,1,7.0,8.0\n";
        let loader = CohortLoader::new();
        let table = loader.parse_table(Cursor::new(csv_data), FileFormat::Csv).unwrap();

        assert_eq!(table.patient_ids, vec!["B", "A"]);
        assert_eq!(table.feature_names, vec!["f1", "f2"]);
        assert_eq!(table.features.dim(), (2, 2, 2));
        // B's visit 0 comes first after sorting
        assert_eq!(table.features[[0, 0, 0]], 3.0);
        assert_eq!(table.outcomes[[0, 0]], 1);
        assert_eq!(table.outcomes[[1, 1]], 1);
        assert!(table.times.is_none());
    }

    #[test]
    fn test_uneven_visits_rejected() {
        let csv_data = "patient,visit,label,f1\nA,0,0,1.0\nA,1,0,1.0\nB,0,1,2.0\n";
        let loader = CohortLoader::new();
        assert!(loader.parse_table(Cursor::new(csv_data), FileFormat::Csv).is_err());
    }

    #[test]
    fn test_survival_columns() {
        let csv_data = "patient\tvisit\ttime\tevent\tf1\nA\t0\t120\t0\t0.5\nB\t0\t30\t1\t0.7\n";
        let loader = CohortLoader::with_config(LoaderConfig::survival());
        let table = loader.parse_table(Cursor::new(csv_data), FileFormat::Tsv).unwrap();

        assert_eq!(table.feature_names, vec!["f1"]);
        let times = table.times.unwrap();
        assert_eq!(times[[1, 0]], 30.0);
        assert_eq!(table.outcomes[[1, 0]], 1);
    }
}
