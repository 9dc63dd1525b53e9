//! Turns an itinerary snapshot into the request sent to the language model.
use std::fmt::Write;

use thiserror::Error;

use crate::{itinerary::Itinerary, llm::ChatMessage};

/// The persona the language model is asked to take on.
pub const SYSTEM_PERSONA: &str = "You are an experienced travel expert. You write practical, \
day by day travel itineraries in Markdown, with suggestions for sights, food and transport \
between destinations.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("Itinerary has no destinations")]
    NoDestinations,
    #[error("Itinerary has no title")]
    MissingTitle,
}

/// Builds generation prompts. Output depends only on the itinerary.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    language: Option<String>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for the document to be written in the given language.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn build(&self, itinerary: &Itinerary) -> Result<String, PromptError> {
        if itinerary.destinations.is_empty() {
            return Err(PromptError::NoDestinations);
        }
        if itinerary.title.trim().is_empty() {
            return Err(PromptError::MissingTitle);
        }

        let mut prompt = String::new();
        let _ = writeln!(
            prompt,
            "Create a detailed travel itinerary titled \"{}\".",
            itinerary.title.trim()
        );
        if !itinerary.description.trim().is_empty() {
            let _ = writeln!(prompt, "Trip description: {}", itinerary.description.trim());
        }
        let _ = writeln!(
            prompt,
            "The trip lasts {} days and visits the following destinations in order:",
            itinerary.span_days()
        );
        for (index, destination) in itinerary.ordered_destinations().into_iter().enumerate() {
            let nights = (destination.departure_date - destination.arrival_date).num_days();
            let _ = writeln!(
                prompt,
                "{}. {}, {}: arriving {}, leaving {} ({} nights)",
                index + 1,
                destination.city,
                destination.country,
                destination.arrival_date.format("%Y-%m-%d"),
                destination.departure_date.format("%Y-%m-%d"),
                nights
            );
        }
        if let Some(notes) = itinerary
            .notes
            .as_deref()
            .map(str::trim)
            .filter(|notes| !notes.is_empty())
        {
            let _ = writeln!(prompt, "Take these notes from the traveller into account: {notes}");
        }
        let _ = write!(
            prompt,
            "Give a plan for every day, including travel between destinations."
        );
        if let Some(language) = &self.language {
            let _ = write!(prompt, " Write the itinerary in {language}.");
        }
        Ok(prompt)
    }

    /// The fixed two message exchange for an itinerary: the persona followed by the prompt.
    pub fn messages(&self, itinerary: &Itinerary) -> Result<Vec<ChatMessage>, PromptError> {
        Ok(vec![
            ChatMessage::system(SYSTEM_PERSONA),
            ChatMessage::user(self.build(itinerary)?),
        ])
    }
}
