//! Final artifacts: the CSV reports and the surviving seeds.
//!
//! Every field written here is numeric or a hex hash, so the rows need no
//! quoting.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
};

use crate::{
    analysis::GlobalProjection,
    pca::distance::{euclidean_full, euclidean_projected, kl_divergence, mahalanobis},
    pca::region::{assign, Region},
    seed::Seed,
    Error,
};

fn csv_writer(out_dir: &Path, name: &str) -> Result<BufWriter<File>, Error> {
    let file = File::create(out_dir.join(name))?;
    Ok(BufWriter::new(file))
}

/// Write all analysis CSVs into `out_dir`.
pub fn export_all(out_dir: &Path, proj: &GlobalProjection) -> Result<(), Error> {
    export_histos(out_dir, proj)?;
    export_pcas(out_dir, proj)?;
    export_distances(out_dir, proj)?;
    export_coords(out_dir, proj)?;
    export_hashes(out_dir, proj)?;
    export_regions(out_dir, proj)?;
    Ok(())
}

/// Per-axis histograms of every admitted PCA.
fn export_histos(out_dir: &Path, proj: &GlobalProjection) -> Result<(), Error> {
    let mut w = csv_writer(out_dir, "histos.csv")?;
    writeln!(w, "seed_n,dim_n,bin_n,start,end,count")?;
    for (seed_n, pca) in proj.pcas.iter().enumerate() {
        let stats = pca.stats();
        for (dim_n, histo) in stats.histos.iter().enumerate() {
            let step = stats.steps[dim_n];
            for (bin_n, &count) in histo.iter().enumerate() {
                writeln!(
                    w,
                    "{seed_n},{dim_n},{bin_n},{:.6},{:.6},{count}",
                    bin_n as f64 * step,
                    (bin_n + 1) as f64 * step,
                )?;
            }
        }
    }
    Ok(())
}

/// One row per PCA axis: phase, sample count and variance.
fn export_pcas(out_dir: &Path, proj: &GlobalProjection) -> Result<(), Error> {
    let mut w = csv_writer(out_dir, "pcas.csv")?;
    writeln!(w, "seed_n,phase,sample_n,axis,variance")?;
    for (seed_n, pca) in proj.pcas.iter().enumerate() {
        for (axis, var) in pca.variances().iter().enumerate() {
            writeln!(
                w,
                "{seed_n},{},{},{axis},{:.9}",
                pca.phase(),
                pca.sample_n(),
                var
            )?;
        }
    }
    Ok(())
}

/// Pairwise distances between the admitted seeds, in every metric.
fn export_distances(out_dir: &Path, proj: &GlobalProjection) -> Result<(), Error> {
    let mut w = csv_writer(out_dir, "distances.csv")?;
    writeln!(
        w,
        "seed_i,seed_j,euclid_full,euclid_proj,mahalanobis,kl_ij,kl_ji"
    )?;
    let n = proj.pcas.len();
    for i in 0..n {
        for j in (i + 1)..n {
            let full = euclidean_full(&proj.center_diffs[i], &proj.center_diffs[j]);
            let projected =
                euclidean_projected(&proj.center_projs[i], &proj.center_projs[j]);
            let maha = mahalanobis(
                &proj.center_projs[i],
                &proj.center_projs[j],
                &proj.merged.variances,
            );
            let kl_ij = kl_divergence(proj.pcas[i], proj.pcas[j]).unwrap_or(f64::NAN);
            let kl_ji = kl_divergence(proj.pcas[j], proj.pcas[i]).unwrap_or(f64::NAN);
            writeln!(
                w,
                "{i},{j},{full:.6},{projected:.6},{maha:.6},{kl_ij:.6},{kl_ji:.6}"
            )?;
        }
    }
    Ok(())
}

/// Global-basis coordinates of each seed's center and trace.
fn export_coords(out_dir: &Path, proj: &GlobalProjection) -> Result<(), Error> {
    let mut w = csv_writer(out_dir, "coords.csv")?;
    writeln!(w, "seed_n,axis,center_coord,seed_coord")?;
    for (seed_n, (center, seed)) in proj
        .center_projs
        .iter()
        .zip(proj.seed_projs.iter())
        .enumerate()
    {
        for axis in 0..proj.merged.dim {
            writeln!(
                w,
                "{seed_n},{axis},{:.6},{:.6}",
                center[axis], seed[axis]
            )?;
        }
    }
    Ok(())
}

/// Per-seed trace-hash frequencies (saturated at 255).
fn export_hashes(out_dir: &Path, proj: &GlobalProjection) -> Result<(), Error> {
    let mut w = csv_writer(out_dir, "hashes.csv")?;
    writeln!(w, "seed_n,hash,count")?;
    for (seed_n, seed) in proj.seeds.iter().enumerate() {
        let Some(pca_fitness) = seed.exec.as_ref().and_then(|e| e.discovery.pca()) else {
            continue;
        };
        let mut counts: Vec<_> = pca_fitness.hash_counts().iter().collect();
        counts.sort_by_key(|(hash, _)| **hash);
        for (hash, count) in counts {
            writeln!(w, "{seed_n},{hash:016x},{count}")?;
        }
    }
    Ok(())
}

/// Region statistics: regions grow around the seed-center projections and
/// collect the seed-trace projections.
fn export_regions(out_dir: &Path, proj: &GlobalProjection) -> Result<(), Error> {
    let mut regions: Vec<Region> = proj
        .center_projs
        .iter()
        .map(|center| Region::new(center.as_slice()))
        .collect();
    for (seed_proj, seed) in proj.seed_projs.iter().zip(proj.seeds.iter()) {
        assign(&mut regions, seed_proj.as_slice(), seed.run.hash);
    }

    let mut w = csv_writer(out_dir, "regions.csv")?;
    writeln!(
        w,
        "region_n,sample_n,species_n,mean_dist,mean_sq_dist,mean_cube_dist,mean_quad_dist"
    )?;
    for (region_n, region) in regions.iter().enumerate() {
        let (m1, m2, m3, m4) = region.distance_moments();
        writeln!(
            w,
            "{region_n},{},{},{m1:.6},{m2:.6},{m3:.6},{m4:.6}",
            region.sample_n(),
            region.species_n(),
        )?;
    }
    Ok(())
}

/// Write every exercised seed's input under `out_dir/seeds/`, named by its
/// hex trace hash.
pub fn write_seed_files(out_dir: &Path, seeds: &[Seed]) -> Result<(), Error> {
    let seed_dir = out_dir.join("seeds");
    fs::create_dir_all(&seed_dir)?;
    for seed in seeds {
        if !seed.exercised() {
            continue;
        }
        let path = seed_dir.join(format!("{:016x}", seed.run.hash));
        fs::write(path, &seed.run.input)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::put::RunRecord;

    #[test]
    fn seed_files_are_named_by_hash() {
        let dir = std::env::temp_dir().join(format!("prismfuzz-report-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let mut run = RunRecord::from_input(vec![b'X']);
        run.hash = 0xabcd;
        let seeds = vec![
            Seed {
                id: 0,
                run,
                exec_n: 2,
                running: false,
                exec: None,
            },
            // Never exercised: not persisted.
            Seed {
                id: 1,
                run: RunRecord::from_input(vec![b'Y']),
                exec_n: 0,
                running: false,
                exec: None,
            },
        ];
        write_seed_files(&dir, &seeds).unwrap();

        let written: Vec<_> = fs::read_dir(dir.join("seeds")).unwrap().collect();
        assert_eq!(written.len(), 1);
        assert_eq!(
            fs::read(dir.join("seeds").join("000000000000abcd")).unwrap(),
            b"X"
        );
        fs::remove_dir_all(&dir).unwrap();
    }
}
