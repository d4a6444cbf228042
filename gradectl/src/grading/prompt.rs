//! Deterministic, versioned prompt templates.
//!
//! Every model in an ensemble receives the same instruction text, built once
//! per job. The version string is persisted with each completed grade so
//! historical results can be traced to the template that produced them.

use std::fmt::Write as _;

use super::job::EssaySubmission;
use super::verdict::Feedback;

/// Bumped whenever either template changes in a way that could shift scores.
pub const PROMPT_VERSION: &str = "2026-05-grading-v4";

/// Build the grading instruction text for one essay.
pub fn build_grading_prompt(essay: &EssaySubmission) -> String {
    let mut prompt = String::with_capacity(essay.body_text.len() + 2048);

    prompt.push_str(
        "You are an experienced essay examiner. Grade the essay below against \
         the assignment and rubric, as one of several independent graders.\n\n",
    );

    let _ = writeln!(prompt, "<assignment>\n{}\n</assignment>\n", essay.instructions.trim());

    if let Some(rubric) = essay
        .rubric_text
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
    {
        let _ = writeln!(prompt, "<rubric>\n{rubric}\n</rubric>\n");
    }

    if !essay.focus_areas.is_empty() {
        prompt.push_str("<focus_areas>\n");
        for area in &essay.focus_areas {
            let _ = writeln!(prompt, "- {}", area.trim());
        }
        prompt.push_str("</focus_areas>\n\n");
    }

    let _ = writeln!(
        prompt,
        "<academic_level>{}</academic_level>\n",
        essay.academic_level.as_str()
    );

    let _ = writeln!(prompt, "<essay>\n{}\n</essay>\n", essay.body_text.trim());

    prompt.push_str(
        "<task>\n\
         Grade the essay for its academic level.\n\
         1. Assign an overall percentage from 0 to 100.\n\
         2. Score each rubric category from 0 to 100. When no rubric is given, \
         score Analysis, Evidence, Structure, and Writing.\n\
         3. List the 2-4 strongest aspects, each with a title, a description, \
         and a direct quote from the essay as evidence.\n\
         4. List the 2-4 most important improvements, each with a title, a \
         description, and a concrete suggestion the student can act on.\n\
         5. Add up to 3 language tips covering grammar, register, or clarity.\n\
         Respond with the JSON object only.\n\
         </task>",
    );

    prompt
}

/// Feedback from one included run, as input to the synthesis pass.
pub struct GraderFeedback<'a> {
    pub model: &'a str,
    pub percentage: f64,
    pub feedback: &'a Feedback,
}

/// Build the synthesis instruction that merges feedback from all included
/// runs into one blended report.
pub fn build_synthesis_prompt(essay: &EssaySubmission, graders: &[GraderFeedback<'_>]) -> String {
    let mut prompt = String::with_capacity(4096);

    let _ = writeln!(
        prompt,
        "You are synthesizing feedback from {} independent essay graders.\n",
        graders.len()
    );

    let _ = writeln!(prompt, "<assignment>\n{}\n</assignment>\n", essay.instructions.trim());

    if let Some(rubric) = essay
        .rubric_text
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
    {
        let _ = writeln!(prompt, "<rubric>\n{rubric}\n</rubric>\n");
    }

    prompt.push_str("<grader_feedback>\n");
    for (index, grader) in graders.iter().enumerate() {
        let body = serde_json::to_string_pretty(grader.feedback)
            .unwrap_or_else(|_| "{}".to_string());
        let _ = writeln!(
            prompt,
            "<grader_{n} model=\"{model}\" percentage=\"{pct}\">\n{body}\n</grader_{n}>\n",
            n = index + 1,
            model = grader.model,
            pct = grader.percentage,
        );
    }
    prompt.push_str("</grader_feedback>\n\n");

    prompt.push_str(
        "<task>\n\
         Merge the graders' feedback into a single coherent report.\n\
         1. STRENGTHS: keep the 3-4 most impactful, preferring points raised \
         by multiple graders and points backed by direct quotes.\n\
         2. IMPROVEMENTS: merge overlapping suggestions into the 3-4 most \
         actionable items, prioritized by the rubric weighting.\n\
         3. LANGUAGE TIPS: consolidate into 2-3 unique tips.\n\
         Preserve the best specific evidence from the original feedback. \
         Respond with the JSON object only.\n\
         </task>",
    );

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::job::AcademicLevel;
    use crate::grading::verdict::{FeedbackPoint, ImprovementPoint};

    fn essay() -> EssaySubmission {
        EssaySubmission {
            instructions: "Discuss the causes of the Industrial Revolution.".to_string(),
            rubric_text: Some("Thesis 40%, Evidence 40%, Writing 20%".to_string()),
            focus_areas: vec!["transitions".to_string()],
            academic_level: AcademicLevel::Undergraduate,
            body_text: "The Industrial Revolution began in Britain...".to_string(),
        }
    }

    #[test]
    fn grading_prompt_is_deterministic() {
        let essay = essay();
        assert_eq!(build_grading_prompt(&essay), build_grading_prompt(&essay));
    }

    #[test]
    fn grading_prompt_contains_all_sections() {
        let prompt = build_grading_prompt(&essay());
        assert!(prompt.contains("<assignment>"));
        assert!(prompt.contains("Thesis 40%"));
        assert!(prompt.contains("- transitions"));
        assert!(prompt.contains("<academic_level>undergraduate</academic_level>"));
        assert!(prompt.contains("The Industrial Revolution began"));
        assert!(prompt.contains("<task>"));
    }

    #[test]
    fn grading_prompt_omits_empty_rubric() {
        let mut essay = essay();
        essay.rubric_text = None;
        essay.focus_areas.clear();
        let prompt = build_grading_prompt(&essay);
        assert!(!prompt.contains("<rubric>"));
        assert!(!prompt.contains("<focus_areas>"));
    }

    #[test]
    fn synthesis_prompt_wraps_each_grader() {
        let feedback = Feedback {
            strengths: vec![FeedbackPoint {
                title: "Clear thesis".to_string(),
                description: "The opening states a specific argument.".to_string(),
                evidence: Some("This essay argues that...".to_string()),
            }],
            improvements: vec![ImprovementPoint {
                title: "Transitions".to_string(),
                description: "Sections connect abruptly.".to_string(),
                suggestion: Some("Add linking sentences.".to_string()),
            }],
            language_tips: vec!["Watch comma splices.".to_string()],
        };
        let graders = vec![
            GraderFeedback {
                model: "x-ai/grok-4",
                percentage: 72.0,
                feedback: &feedback,
            },
            GraderFeedback {
                model: "openai/gpt-5.2",
                percentage: 68.0,
                feedback: &feedback,
            },
        ];

        let prompt = build_synthesis_prompt(&essay(), &graders);
        assert!(prompt.contains("from 2 independent essay graders"));
        assert!(prompt.contains("<grader_1 model=\"x-ai/grok-4\" percentage=\"72\">"));
        assert!(prompt.contains("<grader_2 model=\"openai/gpt-5.2\" percentage=\"68\">"));
        assert!(prompt.contains("Clear thesis"));
    }
}
