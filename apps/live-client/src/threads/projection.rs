//! Two-level thread view (question → answers) derived from a flat message set.
//!
//! The projection is pure: it depends only on the set of messages, never on
//! the order they arrived in, so it is recomputed from scratch after every
//! mutation instead of being patched.

use std::collections::HashMap;

use serde::Serialize;

use crate::models::message::Message;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thread {
    pub question: Message,
    pub answers: Vec<Message>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThreadView {
    pub threads: Vec<Thread>,
}

impl ThreadView {
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn thread(&self, question_id: &str) -> Option<&Thread> {
        self.threads
            .iter()
            .find(|t| t.question.key() == Some(question_id))
    }

    /// Question and answer ids in render order.
    pub fn render_order(&self) -> Vec<&str> {
        self.threads
            .iter()
            .flat_map(|t| std::iter::once(&t.question).chain(t.answers.iter()))
            .filter_map(Message::key)
            .collect()
    }
}

/// Build the thread view for one event's messages.
///
/// Questions sort ascending by `created_at` (observation time when absent),
/// ties broken by id; each question's answers sort the same way. Replies
/// whose parent is missing, blank, or not a question are left out. Plain
/// messages without a parent belong to no thread.
pub fn derive_threads<'a, I>(messages: I) -> ThreadView
where
    I: IntoIterator<Item = &'a Message>,
{
    let mut questions: Vec<&Message> = Vec::new();
    let mut answers_by_parent: HashMap<&str, Vec<&Message>> = HashMap::new();

    for message in messages {
        if message.key().is_none() {
            continue;
        }
        if message.is_question() {
            questions.push(message);
        } else if let Some(parent) = message.parent_key() {
            answers_by_parent.entry(parent).or_default().push(message);
        }
    }

    questions.sort_by(|a, b| a.thread_order(b));
    questions.dedup_by(|a, b| a.key() == b.key());

    let threads = questions
        .into_iter()
        .map(|question| {
            let mut answers = question
                .key()
                .and_then(|key| answers_by_parent.remove(key))
                .unwrap_or_default();
            answers.sort_by(|a, b| a.thread_order(b));
            Thread {
                question: question.clone(),
                answers: answers.into_iter().cloned().collect(),
            }
        })
        .collect();

    ThreadView { threads }
}
