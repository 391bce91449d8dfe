use std::collections::HashMap;
use std::io::{Read, Seek, Write};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Float64Array, Float64Builder, LargeListBuilder,
    RecordBatch, RecordBatchOptions, StringArray, UInt32Array, UInt64Array, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Float64Type, Schema, UInt64Type};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;

use crate::{
    chain::Progress,
    coefficients::SolveMethod,
    state::{ActiveSet, ModelState},
};

/// One retained state of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub iteration: u64,
    pub state: ModelState<()>,
    /// Scalar summary of the likelihood's latent variables, the noise
    /// variance for Gaussian regression.
    pub dispersion: Option<f64>,
    /// Log-likelihood of the retained linear predictor given the latent
    /// variables, up to a constant that does not depend on the predictor.
    pub log_likelihood: f64,
}

/// Retained snapshots and per-sweep statistics of one chain.
#[derive(Debug, Clone)]
pub struct PosteriorSamples {
    chain: u64,
    num_predictors: usize,
    snapshots: Vec<Snapshot>,
    sweeps: Vec<Progress>,
}

impl PosteriorSamples {
    pub fn new(chain: u64, num_predictors: usize) -> Self {
        Self {
            chain,
            num_predictors,
            snapshots: vec![],
            sweeps: vec![],
        }
    }

    pub fn chain(&self) -> u64 {
        self.chain
    }

    pub fn num_predictors(&self) -> usize {
        self.num_predictors
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Statistics of every sweep, including burn-in.
    pub fn sweeps(&self) -> &[Progress] {
        &self.sweeps
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub(crate) fn push_sweep(&mut self, progress: Progress) {
        self.sweeps.push(progress);
    }

    pub(crate) fn push_snapshot(&mut self, snapshot: Snapshot) {
        debug_assert!(snapshot.state.active_set.num_predictors() == self.num_predictors);
        self.snapshots.push(snapshot);
    }

    /// Fraction of snapshots in which each predictor is active. Zeros when
    /// there are no snapshots.
    pub fn inclusion_probabilities(&self) -> Vec<f64> {
        let mut counts = vec![0f64; self.num_predictors];
        for snapshot in &self.snapshots {
            for j in snapshot.state.active_set.iter() {
                counts[j] += 1.;
            }
        }
        let n = self.snapshots.len().max(1) as f64;
        counts.iter_mut().for_each(|c| *c /= n);
        counts
    }

    /// Posterior mean of every coefficient, counting inactive draws as zero.
    pub fn posterior_means(&self) -> Vec<f64> {
        let mut means = vec![0f64; self.num_predictors];
        for snapshot in &self.snapshots {
            for (j, &beta) in snapshot
                .state
                .active_set
                .iter()
                .zip(&snapshot.state.coefficients)
            {
                means[j] += beta;
            }
        }
        let n = self.snapshots.len().max(1) as f64;
        means.iter_mut().for_each(|m| *m /= n);
        means
    }

    pub fn mean_active_size(&self) -> f64 {
        let total: usize = self.snapshots.iter().map(|s| s.state.dim()).sum();
        total as f64 / self.snapshots.len().max(1) as f64
    }

    fn metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            ("chain".to_string(), self.chain.to_string()),
            ("num_predictors".to_string(), self.num_predictors.to_string()),
        ])
    }

    /// Dense coefficients, one `beta_{j}` column per predictor with exact
    /// zeros for inactive predictors.
    pub fn coefficient_table(&self) -> Result<RecordBatch> {
        let mut columns: Vec<(String, ArrayRef)> = vec![(
            "iteration".to_string(),
            Arc::new(UInt64Array::from_iter_values(
                self.snapshots.iter().map(|s| s.iteration),
            )),
        )];
        let mut dense = vec![Vec::with_capacity(self.snapshots.len()); self.num_predictors];
        for snapshot in &self.snapshots {
            for (column, beta) in dense.iter_mut().zip(snapshot.state.dense_coefficients()) {
                column.push(beta);
            }
        }
        for (j, column) in dense.into_iter().enumerate() {
            columns.push((format!("beta_{j}"), Arc::new(Float64Array::from(column))));
        }
        let fields = columns
            .iter()
            .map(|(name, array)| Field::new(name, array.data_type().clone(), false))
            .collect::<Vec<_>>();
        let arrays = columns.into_iter().map(|(_, array)| array).collect();
        record_batch(fields, arrays, self.metadata(), self.snapshots.len())
            .context("Could not convert coefficients to RecordBatch")
    }

    /// The retained states in a form that [`PosteriorSamples::from_state_table`]
    /// reads back exactly.
    pub fn state_table(&self) -> Result<RecordBatch> {
        let n = self.snapshots.len();
        let mut active = LargeListBuilder::new(UInt64Builder::new())
            .with_field(Field::new("item", DataType::UInt64, false));
        let mut coefficients = LargeListBuilder::new(Float64Builder::new())
            .with_field(Field::new("item", DataType::Float64, false));
        let mut local_scales = LargeListBuilder::new(Float64Builder::new())
            .with_field(Field::new("item", DataType::Float64, false));
        for snapshot in &self.snapshots {
            let state = &snapshot.state;
            let indices = state.active_set.iter().map(|j| j as u64).collect::<Vec<_>>();
            active.values().append_slice(&indices);
            active.append(true);
            coefficients.values().append_slice(&state.coefficients);
            coefficients.append(true);
            local_scales.values().append_slice(&state.local_scales);
            local_scales.append(true);
        }

        let fields = vec![
            Field::new("iteration", DataType::UInt64, false),
            Field::new("global_scale", DataType::Float64, false),
            Field::new("dispersion", DataType::Float64, true),
            Field::new("log_likelihood", DataType::Float64, false),
            Field::new_large_list(
                "active_set",
                Field::new("item", DataType::UInt64, false),
                false,
            ),
            Field::new_large_list(
                "coefficients",
                Field::new("item", DataType::Float64, false),
                false,
            ),
            Field::new_large_list(
                "local_scales",
                Field::new("item", DataType::Float64, false),
                false,
            ),
        ];
        let arrays: Vec<ArrayRef> = vec![
            Arc::new(UInt64Array::from_iter_values(
                self.snapshots.iter().map(|s| s.iteration),
            )),
            Arc::new(Float64Array::from_iter_values(
                self.snapshots.iter().map(|s| s.state.global_scale),
            )),
            Arc::new(Float64Array::from(
                self.snapshots.iter().map(|s| s.dispersion).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from_iter_values(
                self.snapshots.iter().map(|s| s.log_likelihood),
            )),
            Arc::new(active.finish()),
            Arc::new(coefficients.finish()),
            Arc::new(local_scales.finish()),
        ];
        record_batch(fields, arrays, self.metadata(), n)
            .context("Could not convert snapshots to RecordBatch")
    }

    /// One row per sweep, burn-in included.
    pub fn stats_table(&self) -> Result<RecordBatch> {
        let sweeps = &self.sweeps;
        let cg_iterations = sweeps
            .iter()
            .map(|p| match p.solve_method {
                SolveMethod::Direct => None,
                SolveMethod::ConjugateGradient { iterations }
                | SolveMethod::Fallback { iterations } => Some(iterations as u64),
            })
            .collect::<Vec<_>>();
        let columns: Vec<(&str, ArrayRef, bool)> = vec![
            (
                "iteration",
                Arc::new(UInt64Array::from_iter_values(sweeps.iter().map(|p| p.iteration))),
                false,
            ),
            (
                "burn_in",
                Arc::new(BooleanArray::from(
                    sweeps.iter().map(|p| p.burn_in).collect::<Vec<_>>(),
                )),
                false,
            ),
            (
                "move_kind",
                Arc::new(StringArray::from(
                    sweeps
                        .iter()
                        .map(|p| p.move_kind.to_string())
                        .collect::<Vec<_>>(),
                )),
                false,
            ),
            (
                "move_possible",
                Arc::new(BooleanArray::from(
                    sweeps.iter().map(|p| p.move_possible).collect::<Vec<_>>(),
                )),
                false,
            ),
            (
                "move_accepted",
                Arc::new(BooleanArray::from(
                    sweeps.iter().map(|p| p.move_accepted).collect::<Vec<_>>(),
                )),
                false,
            ),
            (
                "log_acceptance",
                Arc::new(Float64Array::from(
                    sweeps.iter().map(|p| p.log_acceptance).collect::<Vec<_>>(),
                )),
                true,
            ),
            (
                "active_size",
                Arc::new(UInt64Array::from_iter_values(
                    sweeps.iter().map(|p| p.active_size as u64),
                )),
                false,
            ),
            ("cg_iterations", Arc::new(UInt64Array::from(cg_iterations)), true),
            (
                "cg_fallback",
                Arc::new(BooleanArray::from(
                    sweeps.iter().map(|p| p.fallback()).collect::<Vec<_>>(),
                )),
                false,
            ),
            (
                "retries",
                Arc::new(UInt32Array::from_iter_values(sweeps.iter().map(|p| p.retries))),
                false,
            ),
            (
                "global_scale",
                Arc::new(Float64Array::from_iter_values(
                    sweeps.iter().map(|p| p.global_scale),
                )),
                false,
            ),
        ];
        let fields = columns
            .iter()
            .map(|(name, array, nullable)| Field::new(*name, array.data_type().clone(), *nullable))
            .collect::<Vec<_>>();
        let arrays = columns.into_iter().map(|(_, array, _)| array).collect();
        record_batch(fields, arrays, self.metadata(), sweeps.len())
            .context("Could not convert sweep statistics to RecordBatch")
    }

    /// Rebuild samples from a table written by [`PosteriorSamples::state_table`].
    /// Sweep statistics are not part of that table and come back empty.
    pub fn from_state_table(batch: &RecordBatch) -> Result<Self> {
        let schema = batch.schema();
        let metadata = schema.metadata();
        let chain = parse_metadata(metadata, "chain")?;
        let num_predictors = parse_metadata(metadata, "num_predictors")? as usize;

        let column = |name: &str| {
            batch
                .column_by_name(name)
                .ok_or_else(|| anyhow!("State table has no column {name}"))
        };
        let iteration = column("iteration")?
            .as_primitive_opt::<UInt64Type>()
            .context("iteration must be UInt64")?;
        let global_scale = column("global_scale")?
            .as_primitive_opt::<Float64Type>()
            .context("global_scale must be Float64")?;
        let dispersion = column("dispersion")?
            .as_primitive_opt::<Float64Type>()
            .context("dispersion must be Float64")?;
        let log_likelihood = column("log_likelihood")?
            .as_primitive_opt::<Float64Type>()
            .context("log_likelihood must be Float64")?;
        let active = column("active_set")?
            .as_list_opt::<i64>()
            .context("active_set must be a large list")?;
        let coefficients = column("coefficients")?
            .as_list_opt::<i64>()
            .context("coefficients must be a large list")?;
        let local_scales = column("local_scales")?
            .as_list_opt::<i64>()
            .context("local_scales must be a large list")?;

        let mut samples = Self::new(chain, num_predictors);
        for row in 0..batch.num_rows() {
            let indices = active.value(row);
            let indices = indices
                .as_primitive_opt::<UInt64Type>()
                .context("active_set items must be UInt64")?
                .values()
                .iter()
                .map(|&j| j as usize)
                .collect::<Vec<_>>();
            let coefs = coefficients.value(row);
            let coefs = coefs
                .as_primitive_opt::<Float64Type>()
                .context("coefficients items must be Float64")?;
            let scales = local_scales.value(row);
            let scales = scales
                .as_primitive_opt::<Float64Type>()
                .context("local_scales items must be Float64")?;

            let state = ModelState {
                active_set: ActiveSet::from_indices(num_predictors, &indices)
                    .with_context(|| format!("Invalid active set in row {row}"))?,
                coefficients: coefs.values().to_vec(),
                global_scale: global_scale.value(row),
                local_scales: scales.values().to_vec(),
                likelihood_params: (),
            };
            state
                .check_invariants(&[])
                .with_context(|| format!("Invalid state in row {row}"))?;
            samples.push_snapshot(Snapshot {
                iteration: iteration.value(row),
                state,
                dispersion: (!dispersion.is_null(row)).then(|| dispersion.value(row)),
                log_likelihood: log_likelihood.value(row),
            });
        }
        Ok(samples)
    }

    /// Write the state table as an Arrow IPC file.
    pub fn write_ipc<W: Write>(&self, writer: W) -> Result<W> {
        let batch = self.state_table()?;
        let mut writer = FileWriter::try_new(writer, &batch.schema())
            .context("Could not create Arrow IPC writer")?;
        writer.write(&batch)?;
        writer.finish()?;
        Ok(writer.into_inner()?)
    }

    /// Read samples written by [`PosteriorSamples::write_ipc`].
    pub fn read_ipc<R: Read + Seek>(reader: R) -> Result<Self> {
        let reader = FileReader::try_new(reader, None).context("Could not open Arrow IPC file")?;
        let mut samples: Option<Self> = None;
        for batch in reader {
            let part = Self::from_state_table(&batch?)?;
            match samples.as_mut() {
                None => samples = Some(part),
                Some(samples) => samples.snapshots.extend(part.snapshots),
            }
        }
        samples.ok_or_else(|| anyhow!("Arrow IPC file contains no record batch"))
    }
}

fn record_batch(
    fields: Vec<Field>,
    arrays: Vec<ArrayRef>,
    metadata: HashMap<String, String>,
    num_rows: usize,
) -> Result<RecordBatch> {
    let schema = Schema::new_with_metadata(fields, metadata);
    let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(schema),
        arrays,
        &options,
    )?)
}

fn parse_metadata(metadata: &HashMap<String, String>, key: &str) -> Result<u64> {
    metadata
        .get(key)
        .ok_or_else(|| anyhow!("State table metadata has no {key}"))?
        .parse()
        .with_context(|| format!("Could not parse {key} from the state table metadata"))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::*;

    fn snapshot(iteration: u64, active: &[usize], coefs: &[f64], dispersion: Option<f64>) -> Snapshot {
        Snapshot {
            iteration,
            state: ModelState {
                active_set: ActiveSet::from_indices(4, active).unwrap(),
                coefficients: coefs.to_vec(),
                global_scale: 0.1 + iteration as f64 / 3.,
                local_scales: coefs.iter().map(|b| b.abs().sqrt() + 1e-300).collect(),
                likelihood_params: (),
            },
            dispersion,
            log_likelihood: -(iteration as f64).powi(2) / 7.,
        }
    }

    fn samples() -> PosteriorSamples {
        let mut samples = PosteriorSamples::new(3, 4);
        samples.push_snapshot(snapshot(10, &[2, 0], &[1. / 3., -2.5e-17], Some(0.7)));
        samples.push_snapshot(snapshot(11, &[], &[], None));
        samples.push_snapshot(snapshot(12, &[3, 2, 1], &[f64::MIN_POSITIVE, 4., -1e300], Some(1.)));
        samples.push_snapshot(snapshot(13, &[2], &[0.5], Some(0.9)));
        samples
    }

    #[test]
    fn summaries() {
        let samples = samples();
        assert_eq!(samples.inclusion_probabilities(), vec![0.25, 0.25, 0.75, 0.25]);
        assert_eq!(samples.mean_active_size(), 1.5);
        let means = samples.posterior_means();
        assert_eq!(means[2], (1. / 3. + 4. + 0.5) / 4.);
        assert_eq!(means[1], -1e300 / 4.);

        let empty = PosteriorSamples::new(0, 2);
        assert_eq!(empty.inclusion_probabilities(), vec![0., 0.]);
        assert_eq!(empty.mean_active_size(), 0.);
    }

    #[test]
    fn coefficient_table_has_exact_zeros() {
        let table = samples().coefficient_table().unwrap();
        assert_eq!(table.num_rows(), 4);
        assert_eq!(table.num_columns(), 5);
        let beta_3 = table
            .column_by_name("beta_3")
            .unwrap()
            .as_primitive::<Float64Type>();
        assert_eq!(beta_3.values().to_vec(), vec![0., 0., f64::MIN_POSITIVE, 0.]);
        assert_eq!(table.schema().metadata()["num_predictors"], "4");
    }

    #[test]
    fn ipc_round_trip_is_lossless() {
        let samples = samples();
        let buffer = samples.write_ipc(Cursor::new(Vec::new())).unwrap();
        let restored = PosteriorSamples::read_ipc(Cursor::new(buffer.into_inner())).unwrap();
        assert_eq!(restored.chain(), 3);
        assert_eq!(restored.num_predictors(), 4);
        assert_eq!(restored.snapshots(), samples.snapshots());
        assert_eq!(
            restored
                .snapshots()
                .iter()
                .map(|s| s.log_likelihood.to_bits())
                .collect::<Vec<_>>(),
            [10u64, 11, 12, 13].map(|i| (-(i as f64).powi(2) / 7.).to_bits())
        );
    }

    #[test]
    fn state_table_carries_log_likelihood() {
        let table = samples().state_table().unwrap();
        let field = table.schema().field_with_name("log_likelihood").unwrap().clone();
        assert!(!field.is_nullable());
        let values = table
            .column_by_name("log_likelihood")
            .unwrap()
            .as_primitive::<Float64Type>();
        assert_eq!(values.value(0), -100. / 7.);

        let mut columns = table.columns().to_vec();
        let mut fields = table.schema().fields().to_vec();
        let position = table.schema().index_of("log_likelihood").unwrap();
        columns.remove(position);
        fields.remove(position);
        let without = RecordBatch::try_new(
            Arc::new(Schema::new_with_metadata(fields, table.schema().metadata().clone())),
            columns,
        )
        .unwrap();
        let err = PosteriorSamples::from_state_table(&without).unwrap_err();
        assert!(err.to_string().contains("log_likelihood"));
    }

    #[test]
    fn corrupt_table_is_rejected() {
        let table = samples().state_table().unwrap();
        let without_metadata = RecordBatch::try_new(
            Arc::new(Schema::new(table.schema().fields().clone())),
            table.columns().to_vec(),
        )
        .unwrap();
        assert!(PosteriorSamples::from_state_table(&without_metadata).is_err());
    }
}
