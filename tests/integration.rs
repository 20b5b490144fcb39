use approx::assert_abs_diff_eq;
use driftscan::{
    calibration::CalibrationModel,
    cleaning::{
        BandSelection, ChannelSpectrum, CleanConfigBuilder, CleanedSpectrum, Polarization,
        SpectralCleaner,
    },
    global_fit::{GlobalBaselineFitter, GlobalFitConfigBuilder, ScanRecord},
    image::{accumulate, PixelGrid},
    itertools::Itertools,
    ndarray::Array2,
    preprocessing::{DriftScan, ReductionContextBuilder},
    CalibrationConfig, CalibratorObservation, CalibratorRegistry, FluxUnit,
};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

fn noise(seed: u64, sigma: f64) -> (StdRng, Normal<f64>) {
    (
        StdRng::seed_from_u64(seed),
        Normal::new(0.0, sigma).unwrap(),
    )
}

#[test]
fn test_clean_recovers_source_under_rfi() {
    env_logger::try_init().unwrap_or(());
    let (mut rng, normal) = noise(42, 1.0);
    let rfi = 60..65;
    let spectrum = Array2::from_shape_fn((64, 100), |(_, f)| {
        let level = if rfi.contains(&f) { 1000.0 } else { 10.0 };
        level + normal.sample(&mut rng)
    });

    let config = CleanConfigBuilder::default()
        .band(BandSelection::Fraction {
            min: 0.25,
            max: 0.75,
        })
        .build()
        .unwrap();
    let cleaned = SpectralCleaner::new(config)
        .clean(spectrum.view(), 64.0, 100.0, None)
        .unwrap();

    for bin in rfi {
        assert!(!cleaned.mask[bin], "bin {bin} should be flagged");
    }
    assert_abs_diff_eq!(cleaned.band_min_mhz, 25.0, epsilon = 1e-9);
    assert_abs_diff_eq!(cleaned.band_max_mhz, 75.0, epsilon = 1e-9);
    assert!(cleaned.mask[..25].iter().all(|&m| !m));
    assert!(cleaned.mask[75..].iter().all(|&m| !m));

    // every retained bin carries 10 counts of source, with unit noise
    let retained = cleaned.mask.iter().filter(|&&m| m).count();
    assert!(retained >= 40, "only {retained} bins retained");
    let mean = cleaned.raw_light_curve.iter().sum::<f64>() / 64.0;
    assert!(
        (mean - 10.0 * retained as f64).abs() < 3.0 * (50.0_f64).sqrt(),
        "light curve mean {mean} for {retained} bins"
    );
    // the detrended light curve is centred on zero
    let mut sorted = cleaned.light_curve.clone();
    sorted.sort_by(f64::total_cmp);
    assert!(sorted[32].abs() < 3.0 * (50.0_f64).sqrt());
}

/// Bins newly flagged by a second cleaning pass over `first`'s output.
fn newly_flagged(cleaner: &SpectralCleaner, first: &CleanedSpectrum, num_bins: usize) -> Vec<usize> {
    let second = cleaner
        .clean(first.cleaned_spectrum.view(), 64.0, num_bins as f64, None)
        .unwrap();
    assert_eq!(first.band_min_mhz, second.band_min_mhz);
    assert_eq!(first.band_max_mhz, second.band_max_mhz);
    (0..num_bins)
        .filter(|&bin| first.mask[bin] && !second.mask[bin])
        .collect()
}

#[test]
fn test_recleaning_transit_flags_nothing_new() {
    env_logger::try_init().unwrap_or(());
    let (mut rng, normal) = noise(7, 0.1);
    // a source transit common to every bin, with intermittent RFI
    let spectrum = Array2::from_shape_fn((64, 100), |(t, f)| {
        let transit = 10.0 + 20.0 * (-((t as f64 - 32.0) / 6.0).powi(2) / 2.0).exp();
        let rfi = if (40..43).contains(&f) && t % 4 == 0 {
            500.0
        } else {
            0.0
        };
        transit + rfi + normal.sample(&mut rng)
    });

    let cleaner = SpectralCleaner::default();
    let first = cleaner.clean(spectrum.view(), 64.0, 100.0, None).unwrap();
    for bin in 40..43 {
        assert!(!first.mask[bin]);
    }
    assert_eq!(newly_flagged(&cleaner, &first, 100), Vec::<usize>::new());
    let second = cleaner
        .clean(first.cleaned_spectrum.view(), 64.0, 100.0, None)
        .unwrap();
    assert!(second.mask[40..43].iter().all(|&m| m));
}

#[test]
fn test_recleaning_noisy_rfi_flags_nothing_new() {
    env_logger::try_init().unwrap_or(());
    let cleaner = SpectralCleaner::default();
    for seed in [2, 9, 42] {
        // noise dominated: averaging two bins would halve their variance
        let (mut rng, normal) = noise(seed, 1.0);
        let spectrum = Array2::from_shape_fn((64, 100), |(_, f)| {
            let level = if (60..65).contains(&f) { 1000.0 } else { 10.0 };
            level + normal.sample(&mut rng)
        });
        let first = cleaner.clean(spectrum.view(), 64.0, 100.0, None).unwrap();
        assert!(first.mask[60..65].iter().all(|&m| !m), "seed {seed}");

        assert_eq!(
            newly_flagged(&cleaner, &first, 100),
            Vec::<usize>::new(),
            "seed {seed}"
        );
        let second = cleaner
            .clean(first.cleaned_spectrum.view(), 64.0, 100.0, None)
            .unwrap();
        assert!(
            second.mask[60..65].iter().all(|&m| m),
            "seed {seed}: interpolated bins flagged again"
        );
    }
}

#[test]
fn test_keep_mask_protects_spectral_line() {
    env_logger::try_init().unwrap_or(());
    let (mut rng, normal) = noise(3, 1.0);
    // a line varying strongly in time, as a maser would
    let spectrum = Array2::from_shape_fn((50, 64), |(t, f)| {
        let line = if f == 20 { 200.0 * (t % 5) as f64 } else { 0.0 };
        20.0 + line + normal.sample(&mut rng)
    });
    let cleaner = SpectralCleaner::default();

    let flagged = cleaner.clean(spectrum.view(), 50.0, 64.0, None).unwrap();
    assert!(!flagged.mask[20]);

    let mut keep = vec![false; 64];
    keep[20] = true;
    let kept = cleaner
        .clean(spectrum.view(), 50.0, 64.0, Some(&keep))
        .unwrap();
    assert!(kept.mask[20]);
    for t in 0..50 {
        assert_eq!(kept.cleaned_spectrum[(t, 20)], spectrum[(t, 20)]);
    }
}

#[test]
fn test_cross_polarisation_follows_total_power() {
    env_logger::try_init().unwrap_or(());
    let (mut rng, normal) = noise(11, 1.0);
    let mut total_power = |rfi_bin: usize| {
        Array2::from_shape_fn((40, 48), |(t, f)| {
            let rfi = if f == rfi_bin && t % 2 == 0 { 900.0 } else { 0.0 };
            30.0 + rfi + normal.sample(&mut rng)
        })
    };
    let lcp = total_power(10);
    let rcp = total_power(30);
    // the cross product has its own, different, interference
    let q = Array2::from_shape_fn((40, 48), |(t, f)| {
        if f == 20 && t % 3 == 0 {
            400.0
        } else {
            1.0
        }
    });
    let channels = [
        ("Feed0_LCP", Polarization::Lcp, &lcp),
        ("Feed0_RCP", Polarization::Rcp, &rcp),
        ("Feed0_Q", Polarization::Q, &q),
    ]
    .into_iter()
    .map(|(name, polarization, spectrum)| ChannelSpectrum {
        name: name.into(),
        feed: 0,
        polarization,
        spectrum: spectrum.view(),
    })
    .collect_vec();

    let cleaned = SpectralCleaner::default()
        .clean_feed(&channels, 40.0, 48.0, None)
        .unwrap();
    assert_eq!(
        cleaned.iter().map(|(name, _)| name.as_str()).collect_vec(),
        vec!["Feed0_LCP", "Feed0_RCP", "Feed0_Q"]
    );
    let q_mask = &cleaned[2].1.mask;
    assert!(!q_mask[10]);
    assert!(!q_mask[30]);
    // not flagged in total power, so kept regardless of its own variability
    assert!(q_mask[20]);
    for bin in 0..48 {
        assert_eq!(q_mask[bin], cleaned[0].1.mask[bin] && cleaned[1].1.mask[bin]);
    }
}

/// Three scans over the same track with a common source, each with its own
/// offset and drift.
fn drifting_scans(seed: u64) -> Vec<ScanRecord> {
    let (mut rng, normal) = noise(seed, 0.05);
    let offsets = [(0.0, 0.0), (4.0, 0.02), (-3.0, -0.01)];
    offsets
        .iter()
        .enumerate()
        .map(|(idx, &(intercept, slope))| {
            let time = (0..101).map(|t| 1000.0 * idx as f64 + t as f64).collect_vec();
            let x = (0..101).map(|t| t as f64 / 10.0).collect_vec();
            let counts = x
                .iter()
                .enumerate()
                .map(|(t, x)| {
                    let source = 5.0 * (-(x - 5.0).powi(2)).exp();
                    source + intercept + slope * t as f64 + normal.sample(&mut rng)
                })
                .collect_vec();
            ScanRecord::new(format!("scan{idx}"), time, x, vec![0.5; 101], counts)
        })
        .collect()
}

#[test]
fn test_global_fit_recovers_relative_baselines() {
    env_logger::try_init().unwrap_or(());
    let scans = drifting_scans(5);
    let grid = PixelGrid::regular((0.0, 10.05), 20, (0.0, 1.0), 1).unwrap();
    let fitter = GlobalBaselineFitter::new(
        GlobalFitConfigBuilder::default()
            .max_iterations(1000)
            .build()
            .unwrap(),
    );
    let fit = fitter.fit(&scans, &grid, &[], None).unwrap();

    assert!(fit.objective_end < fit.objective_start);
    for (idx, (intercept, slope)) in [(4.0, 0.02), (-3.0, -0.01)].into_iter().enumerate() {
        let scan = idx + 1;
        assert_abs_diff_eq!(
            fit.params.intercept(scan) - fit.params.intercept(0),
            intercept,
            epsilon = 0.1
        );
        assert_abs_diff_eq!(
            fit.params.slope(scan) - fit.params.slope(0),
            slope,
            epsilon = 2e-3
        );
    }

    let map = |curves: &[Vec<f64>]| {
        let x = scans.iter().flat_map(|s| s.x.iter().copied()).collect_vec();
        let y = scans.iter().flat_map(|s| s.y.iter().copied()).collect_vec();
        let values = curves.iter().flatten().copied().collect_vec();
        accumulate(&x, &y, &values, None, &grid).unwrap()
    };
    let total_variance = |curves: &[Vec<f64>]| -> f64 {
        map(curves).valid_pixels().map(|(_, _, var)| var).sum()
    };
    let raw = scans.iter().map(|s| s.counts.clone()).collect_vec();
    assert!(total_variance(&fit.corrected) < 0.1 * total_variance(&raw));
}

#[test]
fn test_calibrate_with_default_calibrators() {
    env_logger::try_init().unwrap_or(());
    let registry = CalibratorRegistry::with_defaults();
    let ratio = |elevation: f64| 0.02 + 0.01 * elevation;

    let mut table = vec![];
    for source in ["3C286", "3C48"] {
        let (flux, _) = registry
            .tabulated_flux(source, 7.0, 0.5, None)
            .unwrap();
        for step in 0..8 {
            let elevation = 0.3 + 0.1 * step as f64;
            table.push(CalibratorObservation {
                frequency_mhz: 7000.0,
                bandwidth_mhz: 500.0,
                counts: flux / ratio(elevation),
                width_rad: 1e-3,
                elevation_rad: elevation,
                source: source.into(),
                channel: "Feed0_LCP".into(),
                ..Default::default()
            });
        }
    }
    table.push(CalibratorObservation {
        frequency_mhz: 7000.0,
        bandwidth_mhz: 500.0,
        counts: 2000.0,
        elevation_rad: 0.7,
        source: "W51".into(),
        channel: "Feed0_LCP".into(),
        ..Default::default()
    });

    let mut model = CalibrationModel::new(CalibrationConfig::default(), registry);
    model.set_table(table);
    assert_eq!(model.table().iter().filter(|row| row.is_calibrator()).count(), 16);

    let (value, _) = model.convert("Feed0_LCP", FluxUnit::JyPerBeam, 0.7).unwrap();
    assert_abs_diff_eq!(value, ratio(0.7), epsilon = 1e-6);

    let reports = model.check_consistency(None).unwrap();
    assert_eq!(reports.len(), 2);
    for report in &reports {
        assert!(!report.inconsistent, "{report:?}");
        assert_eq!(report.num_rows, 8);
    }

    let warnings = model.compute_source_fluxes().unwrap();
    assert!(warnings.is_empty());
    let target = model
        .table()
        .iter()
        .find(|row| row.source == "W51")
        .unwrap();
    assert_abs_diff_eq!(target.computed_flux_jy, 2000.0 * ratio(0.7), epsilon = 1e-3);
}

#[test]
fn test_reduce_map_in_jansky() {
    env_logger::try_init().unwrap_or(());
    let (mut rng, normal) = noise(17, 0.2);
    // four scans over two rows, each row scanned twice at different offsets
    let spectra = (0..4)
        .map(|idx| {
            let offset = [0.0, 1.0, 0.5, -0.5][idx];
            Array2::from_shape_fn((60, 32), |(t, f)| {
                let rfi = if f == 16 && t % 2 == 0 { 400.0 } else { 0.0 };
                20.0 + offset + rfi + normal.sample(&mut rng)
            })
        })
        .collect_vec();
    let scans = spectra
        .iter()
        .enumerate()
        .map(|(idx, spectrum)| DriftScan {
            id: format!("scan{idx}"),
            channels: vec![ChannelSpectrum {
                name: "Feed0_LCP".into(),
                feed: 0,
                polarization: Polarization::Lcp,
                spectrum: spectrum.view(),
            }],
            time: (0..60).map(|t| 100.0 * idx as f64 + t as f64).collect(),
            x: (0..60).map(|t| t as f64 / 10.0).collect(),
            y: vec![if idx < 2 { 0.5 } else { 1.5 }; 60],
            bandwidth_mhz: 32.0,
            elevation_rad: 0.6,
        })
        .collect_vec();
    let grid = PixelGrid::regular((0.0, 6.0), 6, (0.0, 2.0), 2).unwrap();

    let mut model = CalibrationModel::new(CalibrationConfig::default(), CalibratorRegistry::new());
    model.set_table(
        (0..6)
            .map(|step| CalibratorObservation {
                counts: 100.0,
                flux_jy: 5.0,
                elevation_rad: 0.2 + 0.1 * step as f64,
                channel: "Feed0_LCP".into(),
                source: "CAL".into(),
                ..Default::default()
            })
            .collect(),
    );

    let context = ReductionContextBuilder::default()
        .flux_unit(Some(FluxUnit::JyPerBeam))
        .build()
        .unwrap();
    let reduction = context
        .reduce(&scans, "Feed0_LCP", &grid, Some(&mut model))
        .unwrap();

    for channels in &reduction.cleaned {
        assert!(!channels[0].1.mask[16]);
    }
    assert_eq!(reduction.image.mean.dim(), (6, 2));
    assert!(reduction.fit.is_some());
    // scans of the same row agree once their baselines are removed
    let (a, b) = (&reduction.light_curves[0], &reduction.light_curves[1]);
    let difference = a.iter().zip(b).map(|(a, b)| a - b).sum::<f64>() / 60.0;
    assert!(difference.abs() < 0.1, "rows differ by {difference} Jy");
}
