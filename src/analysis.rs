//! Post-campaign analysis: refresh each seed's trace, then project every
//! admitted seed into the merged global basis.

use nalgebra::DVector;

use crossbeam_channel::{bounded, Receiver};

use crate::{
    exec::{Executor, Job, Worker, WorkerEvent},
    inputgen::SeedCopier,
    pca::{merge::merge_bases, DynPca, MergedBasis},
    seed::Seed,
    trace::{log_vals, MAP_SIZE},
    Error,
};

/// Re-run every seed once (unmutated) on `worker` so its owned trace and
/// hash reflect the current binary behavior.
pub fn collect_seed_traces(worker: &Worker, events: &Receiver<WorkerEvent>, seeds: &mut [Seed]) {
    for seed in seeds.iter_mut() {
        let (fit_tx, fit_rx) = bounded(1);
        let (crash_tx, _crash_rx) = bounded(1);
        let executor = Executor::one_shot(
            Box::new(SeedCopier::new(seed.run.input.clone())),
            fit_tx,
            crash_tx,
        );

        if worker
            .submit(Job {
                seed_id: seed.id,
                executor,
            })
            .is_err()
        {
            log::warn!("trace collection worker is gone");
            return;
        }

        loop {
            match events.recv() {
                Ok(WorkerEvent::Done { seed_id, .. }) if seed_id == seed.id => break,
                Ok(_) => {}
                Err(_) => return,
            }
        }

        match fit_rx.try_recv() {
            Ok(record) => {
                seed.run.status = record.status;
                seed.run.trace = record.trace;
                seed.run.hash = record.hash;
            }
            Err(_) => log::warn!("no trace came back for seed {}", seed.id),
        }
    }
}

/// Everything needed to compare seeds in the global frame.
#[derive(Debug)]
pub struct GlobalProjection<'a> {
    /// Steady-state PCAs, aligned with `seeds`.
    pub pcas: Vec<&'a DynPca>,
    /// The seeds admitted to the projection.
    pub seeds: Vec<&'a Seed>,
    pub merged: MergedBasis,

    /// Per-seed center minus the global center, full length.
    pub center_diffs: Vec<DVector<f64>>,
    /// Per-seed (log-transformed) trace minus the global center.
    pub seed_diffs: Vec<DVector<f64>>,
    /// The two families above, projected into the merged basis.
    pub center_projs: Vec<DVector<f64>>,
    pub seed_projs: Vec<DVector<f64>>,
}

/// Merge the bases of all seeds whose PCA reached the steady state and
/// project everything into the result.
pub fn project_all(seeds: &[Seed]) -> Result<GlobalProjection<'_>, Error> {
    let mut pcas = Vec::new();
    let mut admitted = Vec::new();
    for seed in seeds {
        if let Some(pca) = seed.steady_pca() {
            pcas.push(pca);
            admitted.push(seed);
        }
    }
    if pcas.is_empty() {
        return Err(Error::illegal_state(
            "no seed PCA reached the steady state, nothing to project",
        ));
    }
    log::info!("projecting {} of {} seeds", admitted.len(), seeds.len());

    let merged = merge_bases(&pcas)?;
    println!(
        "Overall projection loss: {:.1}%",
        100.0 * merged.projection_loss
    );

    let lv = log_vals();
    let mut center_diffs = Vec::with_capacity(pcas.len());
    let mut seed_diffs = Vec::with_capacity(pcas.len());
    let mut center_projs = Vec::with_capacity(pcas.len());
    let mut seed_projs = Vec::with_capacity(pcas.len());

    for (pca, seed) in pcas.iter().zip(&admitted) {
        let center_diff = pca.centers() - &merged.centers;
        let trace = &seed.run.trace;
        let seed_diff = DVector::from_fn(MAP_SIZE, |j, _| {
            let hits = trace.get(j).copied().unwrap_or(0);
            lv[hits as usize] - merged.centers[j]
        });

        center_projs.push(merged.project(&center_diff));
        seed_projs.push(merged.project(&seed_diff));
        center_diffs.push(center_diff);
        seed_diffs.push(seed_diff);
    }

    Ok(GlobalProjection {
        pcas,
        seeds: admitted,
        merged,
        center_diffs,
        seed_diffs,
        center_projs,
        seed_projs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::put::RunRecord;

    #[test]
    fn projection_without_steady_pcas_is_an_error() {
        let seeds = vec![Seed {
            id: 0,
            run: RunRecord::from_input(vec![b'A']),
            exec_n: 3,
            running: false,
            exec: None,
        }];
        assert!(matches!(
            project_all(&seeds),
            Err(Error::IllegalState(_))
        ));
    }
}
