//! Rate-distortion search.
//!
//! Given an anchor encode with a measured VMAF score, find for each candidate
//! resolution the CRF whose encode reproduces that score, then recommend the
//! converged encode with the lowest bitrate, if any beats the anchor's.

use std::thread;

use tracing::{error, info, warn};

use crate::encoding::{Encoding, Resolution};
use crate::error::AppError;
use crate::gateway::EncodeScore;

/// Usable CRF domain for the entropy-coding range in use. A probe stepping
/// outside this range without bracketing the target ends the search for
/// that resolution.
pub const CRF_MIN: f64 = 20.0;
pub const CRF_MAX: f64 = 36.0;

/// Outcome of the per-resolution CRF search. Only `Converged` carries an
/// encode; the other variants are normal, reportable non-results.
#[derive(Debug, Clone)]
pub enum KnobSearch {
    /// A CRF reproducing the anchor's score was found.
    Converged(Encoding),
    /// The candidate is the anchor's own resolution; nothing to search.
    AnchorResolution,
    /// No CRF inside the usable domain brackets the anchor's score.
    NoConvergence,
    /// The bracketing probes scored identically, so interpolation is
    /// ill-defined. Reported like no convergence, never a division fault.
    DegenerateBracket,
}

/// Result of a full cross-resolution search.
#[derive(Debug, Clone)]
pub struct Recommendation {
    /// The anchor, encoded and scored.
    pub anchor: Encoding,
    /// The cheapest perceptually-equivalent encode found at another
    /// resolution, or `None` when the anchor remains best.
    pub better: Option<Encoding>,
}

/// The search engine. Owns no encodes beyond a single `search` call; all
/// probing goes through the gateway capability.
pub struct Searcher<'a> {
    gateway: &'a dyn EncodeScore,
    source: &'a Encoding,
    frame_limit: Option<u32>,
}

impl<'a> Searcher<'a> {
    pub fn new(gateway: &'a dyn EncodeScore, source: &'a Encoding, frame_limit: Option<u32>) -> Self {
        Self {
            gateway,
            source,
            frame_limit,
        }
    }

    /// Encode the source at (resolution, crf) and score it against the
    /// source at the source's native resolution.
    fn probe_point(&self, resolution: Resolution, crf: f64) -> Result<Encoding, AppError> {
        let mut encoding = self.gateway.encode(self.source, resolution, crf)?;
        let scores = self
            .gateway
            .score(self.source, &encoding, None, self.frame_limit)?;
        encoding.apply_scores(scores);
        info!("probe: {}", encoding);
        Ok(encoding)
    }

    /// Search for the CRF at `target` that reproduces the anchor's VMAF.
    ///
    /// Walks the CRF axis in unit steps away from the anchor's own CRF
    /// (upward for a larger target resolution, downward for a smaller one)
    /// until two adjacent probes bracket the anchor's score, then linearly
    /// interpolates on the score axis and probes once more at the
    /// interpolated CRF. The walk accepts the first sign change it meets;
    /// on a non-monotone quality curve that bracket is not necessarily the
    /// only root.
    pub fn find_matching_knob(
        &self,
        anchor: &Encoding,
        target: Resolution,
    ) -> Result<KnobSearch, AppError> {
        if !anchor.is_scored() {
            return Err(AppError::Config(
                "anchor encoding has no VMAF score".to_string(),
            ));
        }

        let target = target.resolve(self.source.resolution)?;
        // Resolutions compare by pixel area, so a rotated variant of the
        // anchor's own size counts as the anchor's resolution too.
        if target.pixels() == anchor.resolution.pixels() {
            return Ok(KnobSearch::AnchorResolution);
        }

        let target_vmaf = anchor.vmaf;
        let step = if target.pixels() > anchor.resolution.pixels() {
            1.0
        } else {
            -1.0
        };

        let mut current = self.probe_point(target, anchor.crf)?;

        loop {
            let next_crf = current.crf + step;
            if !(CRF_MIN..=CRF_MAX).contains(&next_crf) {
                info!(
                    "no crf in [{}, {}] reaches vmaf {:.2} at {}",
                    CRF_MIN, CRF_MAX, target_vmaf, target
                );
                return Ok(KnobSearch::NoConvergence);
            }

            let next = self.probe_point(target, next_crf)?;

            if (current.vmaf - target_vmaf) * (next.vmaf - target_vmaf) <= 0.0 {
                if current.vmaf == next.vmaf {
                    warn!(
                        "flat vmaf response between crf {:.2} and {:.2} at {}",
                        current.crf, next.crf, target
                    );
                    return Ok(KnobSearch::DegenerateBracket);
                }

                // (crf0 - crf1) / (crf1 - crf2) = (vmaf0 - vmaf1) / (vmaf1 - vmaf2)
                let interpolated = current.crf
                    + (current.crf - next.crf) * (target_vmaf - current.vmaf)
                        / (current.vmaf - next.vmaf);

                let converged = self.probe_point(target, interpolated)?;
                info!("search crf @{} = {}", target, converged);
                return Ok(KnobSearch::Converged(converged));
            }

            current = next;
        }
    }

    /// Search every candidate resolution and recommend the cheapest encode
    /// that reproduces the anchor's quality, if one beats the anchor's
    /// bitrate.
    ///
    /// Candidates are independent, so each runs on its own worker thread; a
    /// gateway failure inside one candidate is logged and downgrades that
    /// candidate to no-convergence rather than aborting the batch. The one
    /// fatal case is an anchor that cannot be scored.
    pub fn search(
        &self,
        anchor: &Encoding,
        candidates: &[Resolution],
    ) -> Result<Recommendation, AppError> {
        let anchor = self.ensure_scored_anchor(anchor)?;

        let outcomes = thread::scope(|scope| {
            let workers: Vec<_> = candidates
                .iter()
                .map(|&candidate| {
                    let anchor = &anchor;
                    (
                        candidate,
                        scope.spawn(move || self.find_matching_knob(anchor, candidate)),
                    )
                })
                .collect();

            workers
                .into_iter()
                .map(|(candidate, handle)| {
                    let outcome = handle.join().unwrap_or_else(|_| {
                        Err(AppError::Encode("search worker panicked".to_string()))
                    });
                    (candidate, outcome)
                })
                .collect::<Vec<_>>()
        });

        let mut converged = Vec::new();
        for (candidate, outcome) in outcomes {
            match outcome {
                Ok(KnobSearch::Converged(encoding)) => converged.push(encoding),
                Ok(KnobSearch::AnchorResolution) => {
                    info!("skipping {}: anchor's own resolution", candidate);
                }
                Ok(KnobSearch::NoConvergence) | Ok(KnobSearch::DegenerateBracket) => {
                    info!("no match at {}", candidate);
                }
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    warn!("search at {} abandoned: {}", candidate, e);
                }
            }
        }

        let better = converged
            .into_iter()
            .min_by_key(|encoding| encoding.bitrate)
            .filter(|best| best.bitrate < anchor.bitrate);

        match &better {
            Some(best) => info!("better = {}", best),
            None => info!("anchor remains best: {}", anchor),
        }

        Ok(Recommendation { anchor, better })
    }

    /// Resolve the anchor's resolution and make sure it carries a VMAF
    /// score, encoding and scoring it if needed. The anchor is the basis of
    /// every comparison, so failure here is fatal.
    fn ensure_scored_anchor(&self, anchor: &Encoding) -> Result<Encoding, AppError> {
        let resolution = anchor.resolution.resolve(self.source.resolution)?;

        if anchor.is_scored() {
            let mut scored = anchor.clone();
            scored.resolution = resolution;
            return Ok(scored);
        }

        let scored = match self.probe_point(resolution, anchor.crf) {
            Ok(scored) => scored,
            Err(AppError::Cancelled) => return Err(AppError::Cancelled),
            Err(e) => {
                error!("unable to score the anchor encode: {}", e);
                return Err(AppError::Config(format!(
                    "anchor at {} crf {:.2} could not be scored: {}",
                    resolution, anchor.crf, e
                )));
            }
        };

        if !scored.is_scored() {
            error!("no vmaf score for the anchor video");
            return Err(AppError::Config(format!(
                "anchor at {} crf {:.2} produced no VMAF score",
                resolution, anchor.crf
            )));
        }

        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Scores;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Closed-form VMAF response for one resolution.
    #[derive(Debug, Clone, Copy)]
    enum Curve {
        /// vmaf(crf) = base - slope * crf
        Linear { base: f64, slope: f64 },
        Flat(f64),
    }

    impl Curve {
        fn vmaf(&self, crf: f64) -> f64 {
            match *self {
                Curve::Linear { base, slope } => base - slope * crf,
                Curve::Flat(value) => value,
            }
        }
    }

    /// Deterministic in-memory stand-in for the external tools. Bitrate is
    /// `bitrate_base - 100 * crf` so cheaper encodes come from higher CRFs.
    struct FakeGateway {
        curves: HashMap<Resolution, (Curve, u64)>,
        /// Every (resolution, crf) encode issued, in order.
        probes: Mutex<Vec<(Resolution, f64)>>,
        fail_encodes: bool,
    }

    impl FakeGateway {
        fn new(curves: Vec<(Resolution, Curve, u64)>) -> Self {
            Self {
                curves: curves
                    .into_iter()
                    .map(|(res, curve, bitrate_base)| (res, (curve, bitrate_base)))
                    .collect(),
                probes: Mutex::new(Vec::new()),
                fail_encodes: false,
            }
        }

        fn failing() -> Self {
            Self {
                curves: HashMap::new(),
                probes: Mutex::new(Vec::new()),
                fail_encodes: true,
            }
        }

        fn probe_log(&self) -> Vec<(Resolution, f64)> {
            self.probes.lock().unwrap().clone()
        }
    }

    impl EncodeScore for FakeGateway {
        fn encode(
            &self,
            source: &Encoding,
            resolution: Resolution,
            crf: f64,
        ) -> Result<Encoding, AppError> {
            if self.fail_encodes {
                return Err(AppError::Encode("simulated transcoder failure".to_string()));
            }

            let resolution = resolution.resolve(source.resolution)?;
            self.probes.lock().unwrap().push((resolution, crf));

            let (_, bitrate_base) = self
                .curves
                .get(&resolution)
                .ok_or_else(|| AppError::Encode(format!("no curve for {}", resolution)))?;

            let mut encoding = Encoding::new(resolution, crf);
            encoding.path = Some(PathBuf::from(format!("fake/{}_{:.3}.mp4", resolution, crf)));
            encoding.bitrate = (*bitrate_base as f64 - 100.0 * crf).max(0.0) as u64;
            Ok(encoding)
        }

        fn score(
            &self,
            _reference: &Encoding,
            distorted: &Encoding,
            _comparison: Option<Resolution>,
            _frame_limit: Option<u32>,
        ) -> Result<Scores, AppError> {
            let (curve, _) = self
                .curves
                .get(&distorted.resolution)
                .ok_or_else(|| AppError::Score(format!("no curve for {}", distorted.resolution)))?;

            Ok(Scores {
                psnr: 40.0,
                ssim: 0.97,
                vmaf: curve.vmaf(distorted.crf),
            })
        }
    }

    fn exact(width: u32, height: u32) -> Resolution {
        Resolution::Exact { width, height }
    }

    fn source_1080p() -> Encoding {
        let mut source = Encoding::new(exact(1920, 1080), 0.0);
        source.path = Some(PathBuf::from("fake/source.mp4"));
        source.bitrate = 8_000_000;
        source
    }

    fn scored_anchor() -> Encoding {
        let mut anchor = Encoding::new(exact(1920, 1080), 23.0);
        anchor.path = Some(PathBuf::from("fake/anchor.mp4"));
        anchor.bitrate = 4000;
        anchor.vmaf = 95.0;
        anchor
    }

    // Curve reaching the anchor's vmaf 95.0 exactly at crf 21.
    fn reaches_95_at_21() -> Curve {
        Curve::Linear {
            base: 137.0,
            slope: 2.0,
        }
    }

    // Curve that tops out around 70; never reaches 95 inside [20, 36].
    fn never_reaches_95() -> Curve {
        Curve::Linear {
            base: 80.0,
            slope: 0.5,
        }
    }

    #[test]
    fn anchor_resolution_is_a_no_op_without_probes() {
        let gateway = FakeGateway::new(vec![(exact(1920, 1080), reaches_95_at_21(), 6_300)]);
        let source = source_1080p();
        let searcher = Searcher::new(&gateway, &source, None);

        let outcome = searcher
            .find_matching_knob(&scored_anchor(), exact(1920, 1080))
            .unwrap();

        assert!(matches!(outcome, KnobSearch::AnchorResolution));
        assert!(gateway.probe_log().is_empty());
    }

    #[test]
    fn shorter_edge_equal_to_anchor_is_also_a_no_op() {
        let gateway = FakeGateway::new(vec![]);
        let source = source_1080p();
        let searcher = Searcher::new(&gateway, &source, None);

        // 1080p resolves to 1920x1080 against this source.
        let outcome = searcher
            .find_matching_knob(&scored_anchor(), Resolution::ShorterEdge(1080))
            .unwrap();

        assert!(matches!(outcome, KnobSearch::AnchorResolution));
        assert!(gateway.probe_log().is_empty());
    }

    #[test]
    fn rotated_variant_of_the_anchor_size_is_treated_as_the_anchor_resolution() {
        let gateway = FakeGateway::new(vec![]);
        let source = source_1080p();
        let searcher = Searcher::new(&gateway, &source, None);

        // Same pixel area as the 1920x1080 anchor, just swapped sides.
        let outcome = searcher
            .find_matching_knob(&scored_anchor(), exact(1080, 1920))
            .unwrap();

        assert!(matches!(outcome, KnobSearch::AnchorResolution));
        assert!(gateway.probe_log().is_empty());
    }

    #[test]
    fn unscored_anchor_is_rejected_before_probing() {
        let gateway = FakeGateway::new(vec![(exact(1280, 720), reaches_95_at_21(), 4_300)]);
        let source = source_1080p();
        let searcher = Searcher::new(&gateway, &source, None);

        let mut anchor = scored_anchor();
        anchor.vmaf = 0.0;

        let err = searcher
            .find_matching_knob(&anchor, exact(1280, 720))
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(gateway.probe_log().is_empty());
    }

    #[test]
    fn unscoreable_anchor_fails_the_whole_search_before_any_candidate() {
        let gateway = FakeGateway::failing();
        let source = source_1080p();
        let searcher = Searcher::new(&gateway, &source, None);

        let mut anchor = scored_anchor();
        anchor.vmaf = 0.0;

        let err = searcher
            .search(&anchor, &[exact(1280, 720), exact(852, 480)])
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(gateway.probe_log().is_empty());
    }

    #[test]
    fn converges_on_a_monotone_curve_stepping_down() {
        let gateway = FakeGateway::new(vec![(exact(1280, 720), reaches_95_at_21(), 4_300)]);
        let source = source_1080p();
        let searcher = Searcher::new(&gateway, &source, None);

        let outcome = searcher
            .find_matching_knob(&scored_anchor(), exact(1280, 720))
            .unwrap();

        let KnobSearch::Converged(encoding) = outcome else {
            panic!("expected convergence, got {:?}", outcome);
        };
        assert!(
            (encoding.crf - 21.0).abs() <= 1.0,
            "converged crf {} not within one unit of 21",
            encoding.crf
        );
        assert!((encoding.vmaf - 95.0).abs() < 1e-6);

        // Smaller target area: the walk steps downward from the anchor's crf.
        let crfs: Vec<f64> = gateway.probe_log().iter().map(|(_, crf)| *crf).collect();
        assert_eq!(crfs[0], 23.0);
        assert!(crfs[1] < crfs[0]);
    }

    #[test]
    fn converges_on_a_monotone_curve_stepping_up() {
        // Larger target area steps the crf upward; this curve hits 95 at 25.
        let up_curve = Curve::Linear {
            base: 145.0,
            slope: 2.0,
        };
        let gateway = FakeGateway::new(vec![(exact(2560, 1440), up_curve, 9_000)]);
        let mut source = source_1080p();
        source.resolution = exact(2560, 1440);

        // Anchor stays at 1920x1080, which is smaller than the target.
        let searcher = Searcher::new(&gateway, &source, None);
        let outcome = searcher
            .find_matching_knob(&scored_anchor(), exact(2560, 1440))
            .unwrap();

        let KnobSearch::Converged(encoding) = outcome else {
            panic!("expected convergence, got {:?}", outcome);
        };
        assert!((encoding.crf - 25.0).abs() <= 1.0);

        let crfs: Vec<f64> = gateway.probe_log().iter().map(|(_, crf)| *crf).collect();
        assert_eq!(crfs[0], 23.0);
        assert!(crfs[1] > crfs[0]);
    }

    #[test]
    fn flat_response_reports_degenerate_bracket() {
        // Constant response equal to the target score: the very first pair
        // brackets (exact hit) but interpolation would divide by zero.
        let gateway = FakeGateway::new(vec![(exact(1280, 720), Curve::Flat(95.0), 4_300)]);
        let source = source_1080p();
        let searcher = Searcher::new(&gateway, &source, None);

        let outcome = searcher
            .find_matching_knob(&scored_anchor(), exact(1280, 720))
            .unwrap();
        assert!(matches!(outcome, KnobSearch::DegenerateBracket));
    }

    #[test]
    fn unreachable_target_reports_no_convergence() {
        let gateway = FakeGateway::new(vec![(exact(852, 480), never_reaches_95(), 2_900)]);
        let source = source_1080p();
        let searcher = Searcher::new(&gateway, &source, None);

        let outcome = searcher
            .find_matching_knob(&scored_anchor(), exact(852, 480))
            .unwrap();
        assert!(matches!(outcome, KnobSearch::NoConvergence));

        // The walk stops at the domain edge: probes at 23, 22, 21, 20 only.
        let crfs: Vec<f64> = gateway.probe_log().iter().map(|(_, crf)| *crf).collect();
        assert_eq!(crfs, vec![23.0, 22.0, 21.0, 20.0]);
    }

    #[test]
    fn end_to_end_recommends_the_cheapest_converged_resolution() {
        let gateway = FakeGateway::new(vec![
            (exact(1280, 720), reaches_95_at_21(), 4_300),
            (exact(852, 480), never_reaches_95(), 2_900),
        ]);
        let source = source_1080p();
        let searcher = Searcher::new(&gateway, &source, None);

        let recommendation = searcher
            .search(&scored_anchor(), &[exact(1280, 720), exact(852, 480)])
            .unwrap();

        let better = recommendation.better.expect("expected a recommendation");
        assert_eq!(better.resolution, exact(1280, 720));
        assert_eq!(better.bitrate, 2_200);
        assert!(better.bitrate < recommendation.anchor.bitrate);
    }

    #[test]
    fn anchor_remains_best_when_nothing_beats_its_bitrate() {
        // Converges at 720p, but the converged bitrate exceeds the anchor's.
        let gateway = FakeGateway::new(vec![(exact(1280, 720), reaches_95_at_21(), 8_000)]);
        let source = source_1080p();
        let searcher = Searcher::new(&gateway, &source, None);

        let recommendation = searcher
            .search(&scored_anchor(), &[exact(1280, 720)])
            .unwrap();
        assert!(recommendation.better.is_none());
    }

    #[test]
    fn candidate_failures_downgrade_to_no_match_without_aborting() {
        // Only 720p has a curve; 480p probes error out of the gateway.
        let gateway = FakeGateway::new(vec![(exact(1280, 720), reaches_95_at_21(), 4_300)]);
        let source = source_1080p();
        let searcher = Searcher::new(&gateway, &source, None);

        let recommendation = searcher
            .search(&scored_anchor(), &[exact(852, 480), exact(1280, 720)])
            .unwrap();

        let better = recommendation.better.expect("720p should still win");
        assert_eq!(better.resolution, exact(1280, 720));
    }

    #[test]
    fn search_is_a_pure_function_of_the_probe_sequence() {
        let source = source_1080p();
        let anchor = scored_anchor();

        let run = || {
            let gateway = FakeGateway::new(vec![(exact(1280, 720), reaches_95_at_21(), 4_300)]);
            let searcher = Searcher::new(&gateway, &source, None);
            let outcome = searcher.find_matching_knob(&anchor, exact(1280, 720)).unwrap();
            let KnobSearch::Converged(encoding) = outcome else {
                panic!("expected convergence");
            };
            (encoding.crf, gateway.probe_log())
        };

        let (first_crf, first_log) = run();
        let (second_crf, second_log) = run();
        assert_eq!(first_crf, second_crf);
        assert_eq!(first_log, second_log);
    }

    #[test]
    fn unscored_anchor_is_scored_through_the_gateway_first() {
        let gateway = FakeGateway::new(vec![
            (exact(1920, 1080), reaches_95_at_21(), 6_300),
            (exact(1280, 720), reaches_95_at_21(), 4_300),
        ]);
        let source = source_1080p();
        let searcher = Searcher::new(&gateway, &source, None);

        // Anchor arrives as a shorter-edge value with no score, the way the
        // operator describes it.
        let anchor = Encoding::new(Resolution::ShorterEdge(1080), 21.0);

        let recommendation = searcher.search(&anchor, &[exact(1280, 720)]).unwrap();

        // Scored at 1920x1080, crf 21: vmaf 137 - 42 = 95, bitrate 4200.
        assert_eq!(recommendation.anchor.resolution, exact(1920, 1080));
        assert!((recommendation.anchor.vmaf - 95.0).abs() < 1e-9);
        assert_eq!(recommendation.anchor.bitrate, 4_200);

        // 720p converges at crf 21 with bitrate 2200, beating 4200.
        let better = recommendation.better.expect("expected a recommendation");
        assert_eq!(better.bitrate, 2_200);
    }
}
