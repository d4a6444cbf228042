//! Ensemble orchestration: fan-out, outlier filtering, and aggregation.
//!
//! All runs are launched concurrently and the orchestrator waits for every
//! one of them to settle before aggregating. A single run's failure never
//! cancels the others; per-run errors are classified and absorbed here and
//! only surface as a job failure when zero runs produce a usable verdict.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::config::GradingConfig;
use super::job::{EssaySubmission, GradeReport, ModelResult, PercentageRange};
use super::prompt::{self, GraderFeedback};
use super::provider::{GraderClient, ModelCall, ProviderError};
use super::retry::{retry_with_backoff, RetryPolicy};
use super::verdict::{self, CategoryScore, GraderVerdict};

/// Sampling temperature for the synthesis pass; low, for consistent merging.
const SYNTHESIS_TEMPERATURE: f64 = 0.3;

/// Terminal ensemble failure: no run produced a usable verdict.
///
/// Carries the per-run causes for the operator log; none of this reaches the
/// persisted grade or the user.
#[derive(Debug, Error)]
#[error("all {runs} ensemble runs failed")]
pub struct EnsembleExhausted {
    pub runs: usize,
    pub failures: Vec<(String, ProviderError)>,
}

/// A run that produced a usable verdict, possibly after recovery.
#[derive(Debug, Clone)]
struct RunSuccess {
    verdict: GraderVerdict,
    total_tokens: Option<u64>,
    cost: Option<f64>,
    recovered: bool,
}

/// One settled ensemble run, success or exhausted failure.
#[derive(Debug)]
struct RunOutcome {
    index: usize,
    model: String,
    duration_ms: u64,
    result: Result<RunSuccess, ProviderError>,
}

/// Run the full ensemble for one essay and aggregate the survivors.
pub async fn run_ensemble<C: GraderClient + 'static>(
    client: &C,
    essay: &EssaySubmission,
    config: &GradingConfig,
) -> Result<GradeReport, EnsembleExhausted> {
    // Built once; every run receives identical instructions.
    let prompt: Arc<str> = prompt::build_grading_prompt(essay).into();

    let mut join_set = JoinSet::new();
    for (index, spec) in config.runs.iter().enumerate() {
        let client = client.clone();
        let call = ModelCall {
            model: spec.model.clone(),
            prompt: prompt.to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            reasoning_effort: spec.reasoning_effort,
            response_schema: verdict::verdict_schema(),
        };
        let policy = config.retry.clone();

        join_set.spawn(async move {
            let started = Instant::now();
            let result = run_one(&client, &call, &policy).await;
            RunOutcome {
                index,
                model: call.model,
                duration_ms: started.elapsed().as_millis() as u64,
                result,
            }
        });
    }

    // Wait for every task to settle, in whatever order they finish.
    let mut outcomes: Vec<RunOutcome> = Vec::with_capacity(config.runs.len());
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(join_error) => {
                tracing::error!(error = %join_error, "ensemble run task panicked");
            }
        }
    }
    outcomes.sort_by_key(|outcome| outcome.index);

    aggregate(client, essay, config, outcomes).await
}

/// One run: provider call wrapped in retry, then verdict parsing, then a
/// recovery attempt for malformed output.
async fn run_one<C: GraderClient>(
    client: &C,
    call: &ModelCall,
    policy: &RetryPolicy,
) -> Result<RunSuccess, ProviderError> {
    let result = retry_with_backoff(|| attempt(client, call), policy).await;

    match result {
        Ok(success) => Ok(success),
        Err(ProviderError::MalformedOutput {
            raw,
            total_tokens,
            cost,
        }) => match verdict::recover_verdict(&raw) {
            Some(recovered) => {
                tracing::info!(model = %call.model, "recovered malformed grader output");
                Ok(RunSuccess {
                    verdict: recovered,
                    total_tokens,
                    cost,
                    recovered: true,
                })
            }
            None => {
                tracing::warn!(
                    model = %call.model,
                    category = verdict::malformed_reason(&raw),
                    "grader output unrecoverable"
                );
                Err(ProviderError::MalformedOutput {
                    raw,
                    total_tokens,
                    cost,
                })
            }
        },
        Err(error) => Err(error),
    }
}

async fn attempt<C: GraderClient>(
    client: &C,
    call: &ModelCall,
) -> Result<RunSuccess, ProviderError> {
    let reply = client.complete(call).await?;
    match verdict::parse_verdict(&reply.content) {
        Ok(parsed) => Ok(RunSuccess {
            verdict: parsed,
            total_tokens: reply.total_tokens,
            cost: reply.cost,
            recovered: false,
        }),
        Err(_) => Err(ProviderError::MalformedOutput {
            raw: reply.content,
            total_tokens: reply.total_tokens,
            cost: reply.cost,
        }),
    }
}

/// Single-pass furthest-from-mean outlier rule.
///
/// Returns the index of the run to exclude and a human-readable reason, or
/// `None` when every score is within the threshold. At most one run is ever
/// excluded per aggregation pass. A mean of (almost) zero makes relative
/// deviation meaningless, so no exclusion is possible there.
pub fn detect_outlier(scores: &[f64], threshold_percent: f64) -> Option<(usize, String)> {
    if scores.len() < 2 {
        return None;
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    if mean.abs() < 0.01 {
        return None;
    }

    let mut worst: Option<(usize, f64)> = None;
    for (index, &score) in scores.iter().enumerate() {
        let deviation = ((score - mean).abs() / mean) * 100.0;
        match worst {
            Some((_, max)) if deviation <= max => {}
            _ => worst = Some((index, deviation)),
        }
    }

    let (index, deviation) = worst?;
    if deviation > threshold_percent {
        Some((
            index,
            format!(
                "score {:.0} deviates {:.1}% from the ensemble mean {:.1} (threshold {:.0}%)",
                scores[index], deviation, mean, threshold_percent
            ),
        ))
    } else {
        None
    }
}

async fn aggregate<C: GraderClient>(
    client: &C,
    essay: &EssaySubmission,
    config: &GradingConfig,
    outcomes: Vec<RunOutcome>,
) -> Result<GradeReport, EnsembleExhausted> {
    let runs = outcomes.len();

    // Indexes into `outcomes` of runs that produced a verdict.
    let usable: Vec<usize> = outcomes
        .iter()
        .enumerate()
        .filter(|(_, o)| o.result.is_ok())
        .map(|(i, _)| i)
        .collect();

    if usable.is_empty() {
        let failures = outcomes
            .into_iter()
            .filter_map(|o| o.result.err().map(|e| (o.model, e)))
            .collect();
        return Err(EnsembleExhausted { runs, failures });
    }

    let scores: Vec<f64> = usable
        .iter()
        .map(|&i| run_success(&outcomes[i]).verdict.percentage)
        .collect();

    let exclusion = detect_outlier(&scores, config.outlier_threshold_percent);
    let excluded_outcome = exclusion.as_ref().map(|(u, _)| usable[*u]);
    if let Some((u, reason)) = &exclusion {
        tracing::info!(model = %outcomes[usable[*u]].model, reason = %reason, "excluding outlier run");
    }

    let included: Vec<usize> = usable
        .iter()
        .copied()
        .filter(|i| Some(*i) != excluded_outcome)
        .collect();

    // Only reachable in theory: exclusion removes at most one of >= 2 usable
    // runs. Kept as a guard rather than a panic.
    if included.is_empty() {
        let failures = outcomes
            .into_iter()
            .filter_map(|o| o.result.err().map(|e| (o.model, e)))
            .collect();
        return Err(EnsembleExhausted { runs, failures });
    }

    let included_scores: Vec<f64> = included
        .iter()
        .map(|&i| run_success(&outcomes[i]).verdict.percentage)
        .collect();
    let lower = included_scores.iter().copied().fold(f64::INFINITY, f64::min);
    let upper = included_scores
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);

    let category_scores = mean_category_scores(
        included
            .iter()
            .map(|&i| &run_success(&outcomes[i]).verdict.category_scores),
    );

    // The most critical perspective: narrative feedback comes verbatim from
    // the lowest-scoring included run, unless synthesis supersedes it below.
    let most_critical = included
        .iter()
        .copied()
        .min_by(|&a, &b| {
            let sa = run_success(&outcomes[a]).verdict.percentage;
            let sb = run_success(&outcomes[b]).verdict.percentage;
            sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(included[0]);
    let mut feedback = run_success(&outcomes[most_critical]).verdict.feedback.clone();

    let mut synthesis_tokens: Option<u64> = None;
    let mut synthesis_cost: Option<f64> = None;
    if let Some(synthesis_model) = &config.synthesis_model {
        let graders: Vec<GraderFeedback<'_>> = included
            .iter()
            .map(|&i| {
                let success = run_success(&outcomes[i]);
                GraderFeedback {
                    model: &outcomes[i].model,
                    percentage: success.verdict.percentage,
                    feedback: &success.verdict.feedback,
                }
            })
            .collect();
        let call = ModelCall {
            model: synthesis_model.clone(),
            prompt: prompt::build_synthesis_prompt(essay, &graders),
            temperature: SYNTHESIS_TEMPERATURE,
            max_tokens: config.max_tokens,
            reasoning_effort: None,
            response_schema: verdict::feedback_schema(),
        };
        match client.complete(&call).await {
            Ok(reply) => match verdict::parse_feedback(&reply.content) {
                Some(merged) => {
                    synthesis_tokens = reply.total_tokens;
                    synthesis_cost = reply.cost;
                    feedback = merged;
                }
                None => {
                    tracing::warn!(
                        model = %synthesis_model,
                        "synthesis output unusable, keeping lowest scorer's feedback"
                    );
                }
            },
            Err(error) => {
                // Non-fatal: the numeric grade stands either way.
                tracing::warn!(model = %synthesis_model, error = %error, "synthesis pass failed");
            }
        }
    }

    let model_results: Vec<ModelResult> = outcomes
        .iter()
        .enumerate()
        .map(|(i, outcome)| match &outcome.result {
            Ok(success) => {
                let reason = match &exclusion {
                    Some((u, reason)) if usable[*u] == i => Some(reason.clone()),
                    _ => None,
                };
                ModelResult {
                    model: outcome.model.clone(),
                    percentage: Some(success.verdict.percentage),
                    included: Some(i) != excluded_outcome,
                    reason,
                    duration_ms: outcome.duration_ms,
                    cost: success.cost,
                    recovered: success.recovered,
                }
            }
            Err(error) => ModelResult {
                model: outcome.model.clone(),
                percentage: None,
                included: false,
                reason: Some(failure_reason(error).to_string()),
                duration_ms: outcome.duration_ms,
                cost: failure_cost(error),
                recovered: false,
            },
        })
        .collect();

    // Totals cover every run plus the synthesis call; excluded and failed
    // runs still consumed tokens.
    let total_tokens = sum_options(
        outcomes
            .iter()
            .map(|o| match &o.result {
                Ok(success) => success.total_tokens,
                Err(error) => failure_tokens(error),
            })
            .chain(std::iter::once(synthesis_tokens)),
    );
    let api_cost = sum_f64_options(
        outcomes
            .iter()
            .map(|o| match &o.result {
                Ok(success) => success.cost,
                Err(error) => failure_cost(error),
            })
            .chain(std::iter::once(synthesis_cost)),
    );

    Ok(GradeReport {
        percentage_range: PercentageRange { lower, upper },
        category_scores,
        feedback,
        model_results,
        total_tokens,
        api_cost,
        prompt_version: prompt::PROMPT_VERSION.to_string(),
    })
}

fn run_success(outcome: &RunOutcome) -> &RunSuccess {
    outcome
        .result
        .as_ref()
        .expect("caller checked the run succeeded")
}

/// Per-category arithmetic mean across included runs, preserving the order
/// in which categories first appear.
fn mean_category_scores<'a>(
    runs: impl Iterator<Item = &'a Vec<CategoryScore>>,
) -> Vec<CategoryScore> {
    let mut totals: Vec<(String, f64, u32)> = Vec::new();
    for categories in runs {
        for category in categories {
            match totals.iter_mut().find(|(name, _, _)| *name == category.name) {
                Some((_, sum, count)) => {
                    *sum += category.score;
                    *count += 1;
                }
                None => totals.push((category.name.clone(), category.score, 1)),
            }
        }
    }
    totals
        .into_iter()
        .map(|(name, sum, count)| CategoryScore {
            name,
            score: sum / count as f64,
        })
        .collect()
}

/// Short, provider-detail-free classification for persisted run records.
fn failure_reason(error: &ProviderError) -> &'static str {
    match error {
        ProviderError::Timeout => "timed out after retries",
        ProviderError::ConnectionReset => "connection failed after retries",
        ProviderError::RateLimited => "rate limited after retries",
        ProviderError::ServerUnavailable { .. } => "provider unavailable after retries",
        ProviderError::Unauthorized => "provider rejected credentials",
        ProviderError::InvalidRequest { .. } => "provider rejected the request",
        ProviderError::MalformedOutput { .. } => "no usable structured output",
        ProviderError::Unknown { .. } => "unexpected failure",
    }
}

fn failure_tokens(error: &ProviderError) -> Option<u64> {
    match error {
        ProviderError::MalformedOutput { total_tokens, .. } => *total_tokens,
        _ => None,
    }
}

fn failure_cost(error: &ProviderError) -> Option<f64> {
    match error {
        ProviderError::MalformedOutput { cost, .. } => *cost,
        _ => None,
    }
}

fn sum_options(values: impl Iterator<Item = Option<u64>>) -> Option<u64> {
    let mut total = None;
    for value in values.flatten() {
        *total.get_or_insert(0) += value;
    }
    total
}

fn sum_f64_options(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let mut total = None;
    for value in values.flatten() {
        *total.get_or_insert(0.0) += value;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::config::RunSpec;
    use crate::grading::job::AcademicLevel;
    use crate::grading::provider::{GraderReply, MockGraderClient};
    use rstest::rstest;

    fn essay() -> EssaySubmission {
        EssaySubmission {
            instructions: "Analyse Hamlet's internal conflicts.".to_string(),
            rubric_text: Some("Analysis 40%, Evidence 30%, Writing 30%".to_string()),
            focus_areas: vec![],
            academic_level: AcademicLevel::Undergraduate,
            body_text: "Prince Hamlet of Denmark is not a simple hero...".to_string(),
        }
    }

    fn config(models: &[&str]) -> GradingConfig {
        GradingConfig {
            runs: models.iter().map(|m| RunSpec::new(*m)).collect(),
            retry: RetryPolicy::none(),
            ..GradingConfig::fallback()
        }
    }

    fn verdict_json(percentage: f64, strength_title: &str) -> String {
        serde_json::json!({
            "percentage": percentage,
            "category_scores": [
                { "name": "Analysis", "score": percentage },
                { "name": "Evidence", "score": percentage - 10.0 },
            ],
            "feedback": {
                "strengths": [
                    { "title": strength_title, "description": "Well argued." }
                ],
                "improvements": [
                    { "title": "Transitions", "description": "Abrupt shifts.", "suggestion": "Add linking sentences." }
                ],
                "language_tips": ["Check comma usage."]
            }
        })
        .to_string()
    }

    fn reply(content: String) -> GraderReply {
        GraderReply {
            content,
            total_tokens: Some(1000),
            cost: Some(0.01),
        }
    }

    #[rstest]
    #[case(&[50.0, 55.0, 100.0], Some(2))]
    #[case(&[48.0, 50.0, 52.0], None)]
    #[case(&[0.0, 0.0, 0.0], None)]
    #[case(&[70.0], None)]
    fn outlier_detection(#[case] scores: &[f64], #[case] expected: Option<usize>) {
        let result = detect_outlier(scores, 10.0);
        assert_eq!(result.map(|(index, _)| index), expected);
    }

    #[test]
    fn outlier_tie_excludes_exactly_one() {
        let result = detect_outlier(&[50.0, 100.0], 10.0);
        let (index, reason) = result.expect("one run must be excluded");
        assert_eq!(index, 0);
        assert!(reason.contains("deviates"));
    }

    #[tokio::test]
    async fn aggregates_three_clean_runs() {
        let mock = MockGraderClient::new();
        mock.add_reply("a", Ok(reply(verdict_json(72.0, "From A"))));
        mock.add_reply("b", Ok(reply(verdict_json(68.0, "From B"))));
        mock.add_reply("c", Ok(reply(verdict_json(75.0, "From C"))));

        let report = run_ensemble(&mock, &essay(), &config(&["a", "b", "c"]))
            .await
            .unwrap();

        assert_eq!(report.percentage_range.lower, 68.0);
        assert_eq!(report.percentage_range.upper, 75.0);
        // Feedback comes from the lowest-scoring included run.
        assert_eq!(report.feedback.strengths[0].title, "From B");
        assert_eq!(report.model_results.len(), 3);
        assert!(report.model_results.iter().all(|r| r.included));
        assert_eq!(report.total_tokens, Some(3000));
        assert_eq!(report.prompt_version, prompt::PROMPT_VERSION);

        let analysis = &report.category_scores[0];
        assert_eq!(analysis.name, "Analysis");
        assert!((analysis.score - (72.0 + 68.0 + 75.0) / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn excludes_outlier_from_aggregation() {
        let mock = MockGraderClient::new();
        mock.add_reply("a", Ok(reply(verdict_json(50.0, "From A"))));
        mock.add_reply("b", Ok(reply(verdict_json(55.0, "From B"))));
        mock.add_reply("c", Ok(reply(verdict_json(100.0, "From C"))));

        let report = run_ensemble(&mock, &essay(), &config(&["a", "b", "c"]))
            .await
            .unwrap();

        assert_eq!(report.percentage_range.lower, 50.0);
        assert_eq!(report.percentage_range.upper, 55.0);

        let excluded = report
            .model_results
            .iter()
            .find(|r| r.model == "c")
            .unwrap();
        assert!(!excluded.included);
        assert!(excluded.reason.as_ref().unwrap().contains("deviates"));
        // The excluded run's category scores do not count toward the means.
        assert!((report.category_scores[0].score - 52.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn one_failed_run_does_not_fail_the_job() {
        let mock = MockGraderClient::new();
        mock.add_reply("a", Ok(reply(verdict_json(70.0, "From A"))));
        mock.add_reply(
            "b",
            Err(ProviderError::InvalidRequest {
                message: "model offline: internal details".to_string(),
            }),
        );
        mock.add_reply("c", Ok(reply(verdict_json(74.0, "From C"))));

        let report = run_ensemble(&mock, &essay(), &config(&["a", "b", "c"]))
            .await
            .unwrap();

        assert_eq!(report.percentage_range.lower, 70.0);
        assert_eq!(report.percentage_range.upper, 74.0);

        let failed = report.model_results.iter().find(|r| r.model == "b").unwrap();
        assert!(!failed.included);
        assert_eq!(failed.percentage, None);
        // Classification only, never the provider's message.
        assert_eq!(failed.reason.as_deref(), Some("provider rejected the request"));
        assert!(!failed.reason.as_ref().unwrap().contains("internal details"));
    }

    #[tokio::test]
    async fn recovers_code_fenced_run() {
        let mock = MockGraderClient::new();
        let fenced = format!("```json\n{}\n```", verdict_json(66.0, "From A"));
        mock.add_reply("a", Ok(reply(fenced)));
        mock.add_reply("b", Ok(reply(verdict_json(70.0, "From B"))));
        mock.add_reply("c", Ok(reply(verdict_json(72.0, "From C"))));

        let report = run_ensemble(&mock, &essay(), &config(&["a", "b", "c"]))
            .await
            .unwrap();

        let salvaged = report.model_results.iter().find(|r| r.model == "a").unwrap();
        assert!(salvaged.recovered);
        assert!(salvaged.included);
        assert_eq!(salvaged.percentage, Some(66.0));
    }

    #[tokio::test]
    async fn all_runs_failing_exhausts_the_ensemble() {
        let mock = MockGraderClient::new();
        for model in ["a", "b", "c"] {
            mock.add_reply(model, Err(ProviderError::Unauthorized));
        }

        let error = run_ensemble(&mock, &essay(), &config(&["a", "b", "c"]))
            .await
            .unwrap_err();
        assert_eq!(error.runs, 3);
        assert_eq!(error.failures.len(), 3);
    }

    #[tokio::test]
    async fn synthesis_supersedes_lowest_scorer_feedback() {
        let mock = MockGraderClient::new();
        mock.add_reply("a", Ok(reply(verdict_json(72.0, "From A"))));
        mock.add_reply("b", Ok(reply(verdict_json(68.0, "From B"))));
        mock.add_reply("c", Ok(reply(verdict_json(75.0, "From C"))));
        mock.add_reply(
            "synth",
            Ok(reply(
                serde_json::json!({
                    "strengths": [{ "title": "Merged strength", "description": "Combined." }],
                    "improvements": [],
                    "language_tips": []
                })
                .to_string(),
            )),
        );

        let mut cfg = config(&["a", "b", "c"]);
        cfg.synthesis_model = Some("synth".to_string());

        let report = run_ensemble(&mock, &essay(), &cfg).await.unwrap();
        assert_eq!(report.feedback.strengths[0].title, "Merged strength");
        // Numeric aggregation is unchanged by synthesis.
        assert_eq!(report.percentage_range.lower, 68.0);
        assert_eq!(report.percentage_range.upper, 75.0);
        // Synthesis usage counts toward the totals.
        assert_eq!(report.total_tokens, Some(4000));
    }

    #[tokio::test]
    async fn synthesis_failure_falls_back_to_lowest_scorer() {
        let mock = MockGraderClient::new();
        mock.add_reply("a", Ok(reply(verdict_json(72.0, "From A"))));
        mock.add_reply("b", Ok(reply(verdict_json(68.0, "From B"))));
        mock.add_reply("c", Ok(reply(verdict_json(75.0, "From C"))));
        mock.add_reply("synth", Err(ProviderError::Timeout));

        let mut cfg = config(&["a", "b", "c"]);
        cfg.synthesis_model = Some("synth".to_string());

        let report = run_ensemble(&mock, &essay(), &cfg).await.unwrap();
        assert_eq!(report.feedback.strengths[0].title, "From B");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_per_run() {
        let mock = MockGraderClient::new();
        mock.add_reply("a", Err(ProviderError::RateLimited));
        mock.add_reply("a", Ok(reply(verdict_json(70.0, "From A"))));
        mock.add_reply("b", Ok(reply(verdict_json(71.0, "From B"))));
        mock.add_reply("c", Ok(reply(verdict_json(72.0, "From C"))));

        let mut cfg = config(&["a", "b", "c"]);
        cfg.retry = RetryPolicy::default();

        let report = run_ensemble(&mock, &essay(), &cfg).await.unwrap();
        assert_eq!(report.percentage_range.lower, 70.0);
        // Model "a" was called twice, the others once.
        assert_eq!(mock.calls_for("a"), 2);
        assert_eq!(mock.calls_for("b"), 1);
        assert_eq!(mock.call_count(), 4);
    }
}
