use std::collections::VecDeque;
use std::io::{BufRead, Write};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use super::edge::ReviewDecision;
use super::state::SharedState;

/// Responses that approve the plan, compared after trimming and lower-casing.
pub const APPROVAL_TOKENS: &[&str] = &["", "yes", "y", "approve", "ok", "proceed"];

pub fn is_approval(response: &str) -> bool {
    APPROVAL_TOKENS.contains(&response.trim().to_lowercase().as_str())
}

/// Result of one pass through the plan reviewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewOutcome {
    pub text: String,
    pub decision: ReviewDecision,
    pub feedback: Option<String>,
}

/// Source of the human's answer to a proposed plan.
pub trait PlanReviewInput: Send + Sync {
    /// Show `plan` and return one line of response, or `None` when no
    /// input is available (EOF, non-interactive run).
    fn review(&mut self, plan: &str, revision: u32, max_revisions: u32)
        -> BoxFuture<'_, Option<String>>;
}

/// Asks a display task to signal once it has caught up with every event
/// published so far.
pub type DisplayFlush = mpsc::UnboundedSender<oneshot::Sender<()>>;

/// Reads the reviewer's answer from standard input.
#[derive(Debug, Default)]
pub struct StdinReview {
    display: Option<DisplayFlush>,
}

impl StdinReview {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for `display` to catch up before showing the banner, so streamed
    /// plan text never lands after the prompt.
    pub fn with_display_flush(mut self, display: DisplayFlush) -> Self {
        self.display = Some(display);
        self
    }
}

/// Returns once `display` has acknowledged a flush, or at once without one.
pub async fn flush_display(display: Option<&DisplayFlush>) {
    let Some(display) = display else {
        return;
    };
    let (ack, done) = oneshot::channel();
    if display.send(ack).is_ok() {
        // A closed display has nothing left to print
        done.await.ok();
    }
}

pub fn review_banner(plan: &str, revision: u32, max_revisions: u32) -> String {
    let rule = "=".repeat(60);
    let remaining = max_revisions.saturating_sub(revision);
    format!(
        "\n{rule}\n\
         PLAN REVIEW (Revision {revision}/{max_revisions})\n\
         {rule}\n\n{plan}\n\n{rule}\n\n\
         Please review the plan above.\n  \
         - Press Enter or type 'yes' to approve and proceed\n  \
         - Type your feedback to request revisions ({remaining} revision(s) remaining)\n\n\
         Your response: "
    )
}

impl PlanReviewInput for StdinReview {
    fn review(
        &mut self,
        plan: &str,
        revision: u32,
        max_revisions: u32,
    ) -> BoxFuture<'_, Option<String>> {
        let banner = review_banner(plan, revision, max_revisions);
        Box::pin(async move {
            flush_display(self.display.as_ref()).await;
            print!("{banner}");
            std::io::stdout().flush().ok();

            let line = tokio::task::spawn_blocking(|| {
                let mut line = String::new();
                match std::io::stdin().lock().read_line(&mut line) {
                    Ok(0) => None,
                    Ok(_) => Some(line),
                    Err(e) => {
                        warn!(error = %e, "Failed to read plan review input");
                        None
                    }
                }
            })
            .await;
            line.ok().flatten()
        })
    }
}

/// Replays canned responses in order, then behaves like EOF.
#[derive(Debug, Default)]
pub struct ScriptedReview {
    responses: VecDeque<Option<String>>,
    /// `(revision, max_revisions)` for every plan shown.
    pub shown: Vec<(u32, u32)>,
}

impl ScriptedReview {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: responses.into_iter().map(|s| Some(s.into())).collect(),
            shown: Vec::new(),
        }
    }
}

impl PlanReviewInput for ScriptedReview {
    fn review(
        &mut self,
        _plan: &str,
        revision: u32,
        max_revisions: u32,
    ) -> BoxFuture<'_, Option<String>> {
        self.shown.push((revision, max_revisions));
        let next = self.responses.pop_front().flatten();
        Box::pin(async move { next })
    }
}

/// Approve without asking once the revision budget is spent.
pub fn auto_approve(state: &mut SharedState, max_revisions: u32) -> ReviewOutcome {
    info!(max_revisions, "Max revisions reached, auto-approving plan");
    state.plan_revision_requested = false;
    state.push_history(
        "plan_reviewer",
        format!("Plan auto-approved (max {max_revisions} revisions reached)"),
    );
    ReviewOutcome {
        text: "Plan auto-approved after max revisions".to_string(),
        decision: ReviewDecision::Approved,
        feedback: None,
    }
}

/// Fold the reviewer's response into shared state.
///
/// `None` counts as approval so unattended runs go through.
pub fn record_response(state: &mut SharedState, response: Option<String>) -> ReviewOutcome {
    let response = response.unwrap_or_else(|| "yes".to_string());
    let response = response.trim();

    if is_approval(response) {
        state.plan_revision_requested = false;
        state.push_history("plan_reviewer", "Plan approved by user");
        info!("Plan approved by user");
        return ReviewOutcome {
            text: "Plan approved".to_string(),
            decision: ReviewDecision::Approved,
            feedback: None,
        };
    }

    state.plan_revision_requested = true;
    state.plan_feedback = response.to_string();
    state.plan_revision_count += 1;
    state.push_history("plan_reviewer", format!("User feedback: {response}"));
    info!(
        revision = state.plan_revision_count,
        feedback = %response,
        "Plan revision requested"
    );
    ReviewOutcome {
        text: format!("Revision requested: {response}"),
        decision: ReviewDecision::Revise,
        feedback: Some(response.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::edge::{should_proceed_to_supervisor, should_revise_plan};

    #[test]
    fn test_approval_tokens() {
        for input in ["", "yes", "Y", "  approve ", "OK", "Proceed", "\n"] {
            assert!(is_approval(input), "{input:?} should approve");
        }
        for input in ["no", "add a chart", "yes please"] {
            assert!(!is_approval(input), "{input:?} should not approve");
        }
    }

    #[test]
    fn test_feedback_requests_revision() {
        let mut state = SharedState::default();
        let outcome = record_response(&mut state, Some("add a chart\n".into()));

        assert_eq!(outcome.decision, ReviewDecision::Revise);
        assert_eq!(outcome.feedback.as_deref(), Some("add a chart"));
        assert!(state.plan_revision_requested);
        assert_eq!(state.plan_feedback, "add a chart");
        assert_eq!(state.plan_revision_count, 1);
        assert_eq!(state.history()[0].message, "User feedback: add a chart");
        assert!(should_revise_plan(&state));
        assert!(!should_proceed_to_supervisor(&state));
    }

    #[test]
    fn test_approval_leaves_count_alone() {
        let mut state = SharedState::default();
        state.plan_revision_count = 2;
        let outcome = record_response(&mut state, Some("yes".into()));

        assert_eq!(outcome.decision, ReviewDecision::Approved);
        assert_eq!(state.plan_revision_count, 2);
        assert!(!state.plan_revision_requested);
        assert_eq!(state.history()[0].message, "Plan approved by user");
        assert!(should_proceed_to_supervisor(&state));
    }

    #[test]
    fn test_eof_counts_as_approval() {
        let mut state = SharedState::default();
        let outcome = record_response(&mut state, None);
        assert_eq!(outcome.decision, ReviewDecision::Approved);
        assert_eq!(state.plan_revision_count, 0);
    }

    #[test]
    fn test_auto_approve_message() {
        let mut state = SharedState::default();
        state.plan_revision_count = 10;
        state.plan_revision_requested = true;
        let outcome = auto_approve(&mut state, 10);
        assert_eq!(outcome.decision, ReviewDecision::Approved);
        assert!(!state.plan_revision_requested);
        assert_eq!(
            state.history()[0].message,
            "Plan auto-approved (max 10 revisions reached)"
        );
    }

    #[test]
    fn test_banner_shows_plan_and_remaining_revisions() {
        let banner = review_banner("1. load data", 2, 5);
        assert!(banner.contains("PLAN REVIEW (Revision 2/5)"));
        assert!(banner.contains("\n\n1. load data\n\n"));
        assert!(banner.contains("(3 revision(s) remaining)"));
        assert!(banner.ends_with("Your response: "));
    }

    #[tokio::test]
    async fn test_flush_waits_for_display_ack() {
        let (tx, mut rx) = mpsc::unbounded_channel::<oneshot::Sender<()>>();
        let display = tokio::spawn(async move {
            let ack = rx.recv().await.unwrap();
            ack.send(()).unwrap();
            "acked"
        });
        flush_display(Some(&tx)).await;
        assert_eq!(display.await.unwrap(), "acked");
    }

    #[tokio::test]
    async fn test_flush_without_or_with_closed_display_returns() {
        flush_display(None).await;

        let (tx, rx) = mpsc::unbounded_channel::<oneshot::Sender<()>>();
        drop(rx);
        flush_display(Some(&tx)).await;
    }

    #[tokio::test]
    async fn test_scripted_review_runs_out_into_eof() {
        let mut review = ScriptedReview::new(["more detail"]);
        assert_eq!(review.review("plan", 0, 3).await.as_deref(), Some("more detail"));
        assert_eq!(review.review("plan", 1, 3).await, None);
        assert_eq!(review.shown, vec![(0, 3), (1, 3)]);
    }
}
