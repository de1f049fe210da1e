//! Parallel expert panel.
//!
//! One question goes to several personas at once. The calls share nothing
//! and touch no session state; answers are collected once all have finished.

use futures_util::future::join_all;

use parley_providers::{CompletionError, CompletionRequest, CompletionService};
use parley_types::{ApiUsage, Message, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expert {
    pub name: &'static str,
    pub prompt: &'static str,
}

pub const EXPERTS: [Expert; 3] = [
    Expert {
        name: "Analyst",
        prompt: "You are a data analyst. Provide analytical insights with focus on \
                 patterns, trends, and data-driven conclusions.",
    },
    Expert {
        name: "Engineer",
        prompt: "You are a software engineer. Provide technical solutions with focus on \
                 implementation, architecture, and best practices.",
    },
    Expert {
        name: "Scientist",
        prompt: "You are a scientist. Provide scientific explanations with focus on \
                 theory, research, and evidence-based reasoning.",
    },
];

pub const EXPERT_TEMPERATURE: f32 = 0.7;

#[derive(Debug)]
pub struct ExpertAnswer {
    pub expert: &'static str,
    pub answer: Result<String, CompletionError>,
    pub usage: ApiUsage,
}

/// Put `question` to every expert concurrently. Answers come back in
/// panel order.
pub async fn consult_experts(
    service: &dyn CompletionService,
    model: &str,
    question: &str,
    experts: &[Expert],
) -> Vec<ExpertAnswer> {
    let calls = experts.iter().map(|expert| async move {
        let messages = match (
            Message::try_new(Role::System, expert.prompt),
            Message::try_user(question),
        ) {
            (Ok(system), Ok(user)) => vec![system, user],
            _ => {
                return ExpertAnswer {
                    expert: expert.name,
                    answer: Err(CompletionError::InvalidResponse(
                        "empty question".to_string(),
                    )),
                    usage: ApiUsage::default(),
                };
            }
        };
        let request =
            CompletionRequest::new(model, &messages).with_temperature(EXPERT_TEMPERATURE);
        match service.complete(request).await {
            Ok(completion) => ExpertAnswer {
                expert: expert.name,
                answer: Ok(completion.text.into_inner()),
                usage: completion.usage,
            },
            Err(e) => {
                tracing::warn!(expert = expert.name, error = %e, "Expert call failed");
                ExpertAnswer {
                    expert: expert.name,
                    answer: Err(e),
                    usage: ApiUsage::default(),
                }
            }
        }
    });
    join_all(calls).await
}
