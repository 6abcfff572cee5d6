//! PM cascade producers: enriched prompts, deterministic PM session keys,
//! and the bounded wait for a PM reply.
//!
//! "Chat with the PM and wait" is a poll of `chat.history` with a short
//! interval and a hard cap. The store lock is never held across the wait;
//! on timeout the caller gets a "still working" outcome and may retry.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use braid_store::{CascadeMode, CascadeState, ChatMessage, GoalStatus};

use super::{GoalCascadeOutcome, StrandCascadeOutcome};
use crate::engine::Engine;
use crate::roles::{pm_goal_session_key, pm_strand_session_key, resolve_agent};
use crate::scheduler::context::build_project_summary;

/// A prepared PM cascade: the session key and prompt, and whether the
/// prompt was handed to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmCascade {
    /// Present for goal-level cascades; absent for strand-level chat.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    pub session_key: String,
    pub prompt: String,
    pub sent: bool,
}

/// Outcome of a strand-level PM chat round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmChatOutcome {
    pub session_key: String,
    /// The PM's reply, or `None` when the wait timed out.
    pub reply: Option<String>,
    pub message: String,
}

impl Engine {
    /// Prepare (and optionally send) a goal-level cascade prompt.
    ///
    /// Marks the goal `awaiting_plan`, stores its deterministic PM session
    /// key, and registers it on the strand's pending-cascade list. The PM
    /// reply is handled by `agent_end`.
    pub async fn pm_goal_cascade(
        &self,
        goal_id: &str,
        mode: Option<CascadeMode>,
        send: bool,
    ) -> Result<PmCascade> {
        let clock = Arc::clone(&self.clock);
        let config = self.config.clone();
        let goal_id_owned = goal_id.to_owned();

        let (session_key, prompt) = self
            .store
            .update(move |data| {
                let pm_agent = resolve_agent(data, &config, "pm");
                let goal = data
                    .goal(&goal_id_owned)
                    .with_context(|| format!("goal {goal_id_owned} not found"))?
                    .clone();

                let session_key = pm_goal_session_key(&pm_agent, &goal_id_owned);
                let prompt = build_goal_cascade_prompt(
                    data,
                    &goal,
                    mode.unwrap_or(goal.cascade_mode),
                );

                let goal_mut = data.goal_mut(&goal_id_owned).expect("goal exists");
                if let Some(mode) = mode {
                    goal_mut.cascade_mode = mode;
                }
                goal_mut.cascade_state = Some(CascadeState::AwaitingPlan);
                goal_mut.pm_session_key = Some(session_key.clone());
                goal_mut.touch(clock.as_ref());

                if let Some(strand_id) = goal.strand_id.clone() {
                    let strand = data.strand_mut(&strand_id).expect("strand exists");
                    let pending = strand.cascade_pending_goals.get_or_insert_with(Vec::new);
                    if !pending.contains(&goal_id_owned) {
                        pending.push(goal_id_owned.clone());
                    }
                    strand.touch(clock.as_ref());
                }

                Ok((session_key, prompt))
            })
            .await?;

        let mut sent = false;
        if send {
            match self.gateway.chat_send(&session_key, &prompt).await {
                Ok(()) => sent = true,
                Err(e) => {
                    tracing::warn!(goal_id = %goal_id, error = %e, "failed to send cascade prompt");
                }
            }
        }

        Ok(PmCascade {
            goal_id: Some(goal_id.to_owned()),
            session_key,
            prompt,
            sent,
        })
    }

    /// Strand-wide cascade: run a goal cascade for every goal that has no
    /// tasks yet, populating the strand's pending list.
    pub async fn pm_strand_cascade(&self, strand_id: &str, send: bool) -> Result<Vec<PmCascade>> {
        let data = self.store.snapshot().await;
        if data.strand(strand_id).is_none() {
            anyhow::bail!("strand {strand_id} not found");
        }
        let targets: Vec<String> = data
            .goals_for_strand(strand_id)
            .into_iter()
            .filter(|g| g.tasks.is_empty() && g.status != GoalStatus::Done)
            .map(|g| g.id.clone())
            .collect();

        let mut cascades = Vec::new();
        for goal_id in targets {
            cascades.push(self.pm_goal_cascade(&goal_id, None, send).await?);
        }
        Ok(cascades)
    }

    /// Strand-level PM chat: send a message to the strand PM and wait
    /// (bounded) for its reply.
    pub async fn pm_chat(&self, strand_id: &str, message: &str) -> Result<PmChatOutcome> {
        let clock = Arc::clone(&self.clock);
        let config = self.config.clone();
        let max_history = self.config.max_history;
        let strand_id_owned = strand_id.to_owned();
        let message_owned = message.to_owned();

        let (session_key, outbound) = self
            .store
            .update(move |data| {
                let pm_agent = resolve_agent(data, &config, "pm");
                let strand = data
                    .strand_mut(&strand_id_owned)
                    .with_context(|| format!("strand {strand_id_owned} not found"))?;

                let session_key = strand
                    .pm_strand_session_key
                    .clone()
                    .or_else(|| config.pm_session.clone())
                    .unwrap_or_else(|| pm_strand_session_key(&pm_agent, &strand_id_owned));
                strand.pm_strand_session_key = Some(session_key.clone());

                // First contact gets the project summary prepended.
                let outbound = if strand.pm_chat_history.is_empty() {
                    let strand_snapshot = strand.clone();
                    format!(
                        "{}\n{}",
                        build_project_summary(data, &strand_snapshot, None),
                        message_owned
                    )
                } else {
                    message_owned.clone()
                };
                let strand = data.strand_mut(&strand_id_owned).expect("strand exists");
                strand.push_history(ChatMessage::user(message_owned.clone()), max_history);
                strand.touch(clock.as_ref());
                data.session_strand_index
                    .insert(session_key.clone(), strand_id_owned.clone());
                Ok((session_key, outbound))
            })
            .await?;

        let baseline = match self.gateway.chat_history(&session_key, 50).await {
            Ok(turns) => turns.iter().filter(|t| t.role == "assistant").count(),
            Err(_) => 0,
        };

        self.gateway
            .chat_send(&session_key, &outbound)
            .await
            .context("failed to reach the PM gateway")?;

        let reply = self.await_pm_response(&session_key, baseline).await?;

        if let Some(text) = &reply {
            let clock = Arc::clone(&self.clock);
            let max_history = self.config.max_history;
            let strand_id_owned = strand_id.to_owned();
            let text_owned = text.clone();
            self.store
                .update(move |data| {
                    let strand = data
                        .strand_mut(&strand_id_owned)
                        .with_context(|| format!("strand {strand_id_owned} not found"))?;
                    strand.push_history(ChatMessage::assistant(text_owned), max_history);
                    strand.touch(clock.as_ref());
                    Ok(())
                })
                .await?;
        }

        let message = match &reply {
            Some(_) => "PM replied".to_owned(),
            None => "PM is still working; retry shortly".to_owned(),
        };
        Ok(PmChatOutcome {
            session_key,
            reply,
            message,
        })
    }

    /// Prepare (and optionally send) a strand-level PM chat message
    /// without waiting for the reply.
    pub async fn pm_strand_chat(
        &self,
        strand_id: &str,
        message: &str,
        send: bool,
    ) -> Result<PmCascade> {
        let clock = Arc::clone(&self.clock);
        let config = self.config.clone();
        let max_history = self.config.max_history;
        let strand_id_owned = strand_id.to_owned();
        let message_owned = message.to_owned();

        let (session_key, prompt) = self
            .store
            .update(move |data| {
                let pm_agent = resolve_agent(data, &config, "pm");
                let strand = data
                    .strand(&strand_id_owned)
                    .with_context(|| format!("strand {strand_id_owned} not found"))?
                    .clone();

                let session_key = strand
                    .pm_strand_session_key
                    .clone()
                    .or_else(|| config.pm_session.clone())
                    .unwrap_or_else(|| pm_strand_session_key(&pm_agent, &strand_id_owned));
                // First contact on an unplanned strand asks for a
                // structured goals plan; later turns pass through.
                let prompt = if strand.pm_chat_history.is_empty() {
                    if strand.pm_plan_content.is_none() {
                        build_strand_plan_prompt(&strand, &message_owned)
                    } else {
                        format!(
                            "{}\n{}",
                            build_project_summary(data, &strand, None),
                            message_owned
                        )
                    }
                } else {
                    message_owned.clone()
                };

                let strand = data.strand_mut(&strand_id_owned).expect("strand exists");
                strand.pm_strand_session_key = Some(session_key.clone());
                strand.push_history(ChatMessage::user(message_owned.clone()), max_history);
                strand.touch(clock.as_ref());
                data.session_strand_index
                    .insert(session_key.clone(), strand_id_owned.clone());
                Ok((session_key, prompt))
            })
            .await?;

        let mut sent = false;
        if send {
            match self.gateway.chat_send(&session_key, &prompt).await {
                Ok(()) => sent = true,
                Err(e) => {
                    tracing::warn!(strand_id = %strand_id, error = %e, "failed to send PM chat");
                }
            }
        }

        Ok(PmCascade {
            goal_id: None,
            session_key,
            prompt,
            sent,
        })
    }

    /// Save a PM response onto a goal and advance its cascade using the
    /// goal's configured mode.
    pub async fn pm_save_response(&self, goal_id: &str, content: &str) -> Result<GoalCascadeOutcome> {
        let mode = {
            let data = self.store.snapshot().await;
            data.goal(goal_id)
                .with_context(|| format!("goal {goal_id} not found"))?
                .cascade_mode
        };
        self.create_tasks_from_plan(goal_id, content, mode).await
    }

    /// Materialize tasks from a plan already saved on the goal (or from
    /// explicitly provided content).
    pub async fn pm_create_tasks(
        &self,
        goal_id: &str,
        content: Option<String>,
        mode: Option<CascadeMode>,
    ) -> Result<GoalCascadeOutcome> {
        let data = self.store.snapshot().await;
        let goal = data
            .goal(goal_id)
            .with_context(|| format!("goal {goal_id} not found"))?;
        let mode = mode.unwrap_or(goal.cascade_mode);
        let (content, from_history) = match content {
            Some(c) => (c, false),
            None => (
                goal.pm_chat_history
                    .iter()
                    .rev()
                    .find(|m| m.role == "assistant")
                    .map(|m| m.content.clone())
                    .context("no saved PM response on this goal")?,
                true,
            ),
        };
        self.create_tasks_from_plan_inner(goal_id, &content, mode, !from_history)
            .await
    }

    /// Create goals on a strand from the saved plan markdown (or from
    /// explicitly provided content).
    pub async fn pm_strand_create_goals(
        &self,
        strand_id: &str,
        content: Option<String>,
    ) -> Result<StrandCascadeOutcome> {
        let content = match content {
            Some(c) => c,
            None => {
                let data = self.store.snapshot().await;
                let strand = data
                    .strand(strand_id)
                    .with_context(|| format!("strand {strand_id} not found"))?;
                strand
                    .pm_plan_content
                    .clone()
                    .or_else(|| {
                        strand
                            .pm_chat_history
                            .iter()
                            .rev()
                            .find(|m| m.role == "assistant")
                            .map(|m| m.content.clone())
                    })
                    .context("no saved plan on this strand")?
            }
        };
        self.create_goals_from_plan(strand_id, &content).await
    }

    /// Poll `chat.history` until a new assistant turn appears, the cap
    /// expires, or the engine shuts down.
    pub(crate) async fn await_pm_response(
        &self,
        session_key: &str,
        baseline_assistant_turns: usize,
    ) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + self.config.pm_poll_timeout;
        loop {
            match self.gateway.chat_history(session_key, 50).await {
                Ok(turns) => {
                    let assistants: Vec<_> =
                        turns.iter().filter(|t| t.role == "assistant").collect();
                    if assistants.len() > baseline_assistant_turns {
                        let latest = assistants.last().expect("non-empty");
                        return Ok(Some(latest.content.text()));
                    }
                }
                Err(e) => {
                    tracing::warn!(session_key = %session_key, error = %e, "history poll failed");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.pm_poll_interval) => {}
                _ = self.shutdown.cancelled() => return Ok(None),
            }
        }
    }
}

/// Prompt asking a goal PM for a plan (and, in `full` mode, tasks).
fn build_goal_cascade_prompt(
    data: &braid_store::Data,
    goal: &braid_store::Goal,
    mode: CascadeMode,
) -> String {
    let mut out = String::new();
    if let Some(strand) = goal.strand_id.as_ref().and_then(|sid| data.strand(sid)) {
        out.push_str(&build_project_summary(data, strand, Some(&goal.id)));
        out.push('\n');
        if let Some(plan) = &strand.pm_plan_content {
            out.push_str("## Project plan\n");
            out.push_str(plan);
            out.push_str("\n\n");
        }
    }
    out.push_str(&format!(
        "You are the project manager for the goal \"{}\".\n",
        goal.title
    ));
    if !goal.description.is_empty() {
        out.push_str(&goal.description);
        out.push('\n');
    }
    out.push('\n');
    match mode {
        CascadeMode::Full => {
            out.push_str(
                "Break this goal into concrete worker tasks. Reply with markdown containing a \
                 `## Tasks` section, one bullet per task in execution order:\n\
                 - [agent] task text - short description (est: 30m)\n\
                 Use agent roles like backend, frontend, or main.\n",
            );
        }
        CascadeMode::Plan => {
            out.push_str(
                "Write an implementation plan for this goal as markdown under a `## Plan` \
                 heading. Do not list tasks yet; they will be requested after review.\n",
            );
        }
    }
    out
}

/// Prompt asking the strand PM to structure a project into goals.
pub(crate) fn build_strand_plan_prompt(strand: &braid_store::Strand, request: &str) -> String {
    let mut out = format!(
        "You are the project manager for \"{}\".\n{}\n\n",
        strand.name, strand.description
    );
    out.push_str(request);
    out.push_str(
        "\n\nReply with markdown containing a `## Goals` section, one bullet per goal in \
         delivery order:\n- **Goal title** - short description (phase 1)\n\
         Group goals that can run in parallel into the same phase, and put suggested tasks \
         as nested bullets under each goal.\n",
    );
    out
}
