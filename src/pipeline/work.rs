//! Per-phase planning, estimation, and payload preparation.
//!
//! Everything here is pure: given the parsed book, the persisted state, and
//! the configuration, these functions decide which unit keys a phase owns,
//! project token/cost usage, and assemble the exact prompts to send.
//! No network, no I/O.

use serde_json::Value;

use crate::book::ParsedBook;
use crate::budget::{calculate_splits, TokenEstimator};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::state::{ElementCatalog, ElementKind, Phase, PipelineState, Status, StoryElement};

/// Token allowance for the instruction template around the chapter text.
const PROMPT_ENVELOPE_TOKENS: u64 = 300;

/// One unit with its request payload(s) assembled, ready for dispatch.
#[derive(Debug, Clone)]
pub struct PreparedUnit {
    pub key: String,
    pub prompts: Vec<String>,
    /// True when some chunk still exceeds the usable window; the unit is
    /// failed with a budget error instead of being dispatched.
    pub oversized: bool,
    /// Estimate for the largest single chunk, reported on budget failures.
    pub approx_tokens: u64,
}

/// Up-front projection for one unit, computed during `estimate`.
#[derive(Debug, Clone)]
pub struct UnitProjection {
    pub key: String,
    pub input_tokens: u64,
    pub cost: f64,
    pub needs_chunking: bool,
}

/// A story element seeded from the analyze phase's inline results.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementSeed {
    pub name: String,
    pub kind: ElementKind,
    /// Chapters the element was mentioned in.
    pub mentions: Vec<u32>,
    /// Free-form notes carried from analysis.
    pub notes: Vec<String>,
}

/// Determine the full set of unit keys a phase must produce.
///
/// Chapter phases own one unit per chapter. The extract phase reuses the
/// element mentions that analyze left inline in its results; only when no
/// such data exists does it fall back to deriving elements chapter by
/// chapter from raw text.
pub fn plan_units(
    phase: Phase,
    book: &ParsedBook,
    state: &PipelineState,
) -> Result<Vec<String>, PipelineError> {
    if book.chapters.is_empty() {
        return Err(PipelineError::Input {
            phase,
            reason: "parser produced no chapters".to_string(),
        });
    }

    match phase {
        Phase::Parse | Phase::Analyze | Phase::Illustrate => {
            Ok(book.chapters.iter().map(|c| c.unit_key()).collect())
        }
        Phase::Extract => {
            let seeds = element_seeds_from_analyze(state);
            if seeds.is_empty() {
                // No reusable element data: derive per chapter.
                Ok(book.chapters.iter().map(|c| c.unit_key()).collect())
            } else {
                Ok(seeds.into_iter().map(|s| s.name).collect())
            }
        }
    }
}

/// Collect element seeds from the analyze phase's unit results.
///
/// Analyze results may inline an `elements` array per chapter; duplicates
/// across chapters are merged, preserving first-seen order. An empty return
/// means analyze produced no reusable element data.
pub fn element_seeds_from_analyze(state: &PipelineState) -> Vec<ElementSeed> {
    let mut seeds: Vec<ElementSeed> = Vec::new();

    let Some(analyze) = state.phase(Phase::Analyze) else {
        return seeds;
    };

    for (key, unit) in &analyze.units {
        if unit.status != Status::Completed {
            continue;
        }
        let Some(result) = &unit.result else { continue };
        let chapter = key
            .strip_prefix("chapter-")
            .and_then(|n| n.parse::<u32>().ok());

        for part in result_parts(result) {
            let Some(elements) = part.get("elements").and_then(Value::as_array) else {
                continue;
            };
            for element in elements {
                let Some(name) = element.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let note = element
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string);

                if let Some(seed) = seeds.iter_mut().find(|s| s.name == name) {
                    if let Some(ch) = chapter {
                        if !seed.mentions.contains(&ch) {
                            seed.mentions.push(ch);
                        }
                    }
                    if let Some(note) = note {
                        if !seed.notes.contains(&note) {
                            seed.notes.push(note);
                        }
                    }
                } else {
                    seeds.push(ElementSeed {
                        name: name.to_string(),
                        kind: parse_element_kind(element.get("kind").and_then(Value::as_str)),
                        mentions: chapter.into_iter().collect(),
                        notes: note.into_iter().collect(),
                    });
                }
            }
        }
    }

    seeds
}

/// A chunked unit's result is an array of per-chunk payloads; a single-call
/// unit's result is the payload itself.
fn result_parts(result: &Value) -> Vec<&Value> {
    match result {
        Value::Array(parts) => parts.iter().collect(),
        other => vec![other],
    }
}

fn parse_element_kind(kind: Option<&str>) -> ElementKind {
    match kind {
        Some("place") => ElementKind::Place,
        Some("item") => ElementKind::Item,
        Some("creature") => ElementKind::Creature,
        _ => ElementKind::Character,
    }
}

/// Build the element catalog from completed extract units.
///
/// Element-mode units (keyed by element name) contribute one entry each;
/// derive-mode units (keyed by chapter) contribute the element lists their
/// results carry. First occurrence of a name wins.
pub fn assemble_element_catalog(state: &PipelineState) -> ElementCatalog {
    let seeds = element_seeds_from_analyze(state);
    let mut catalog = ElementCatalog::default();

    let Some(extract) = state.phase(Phase::Extract) else {
        return catalog;
    };

    for (key, unit) in &extract.units {
        if unit.status != Status::Completed {
            continue;
        }
        let Some(result) = &unit.result else { continue };

        if key.starts_with("chapter-") {
            for part in result_parts(result) {
                let Some(list) = part.get("elements").and_then(Value::as_array) else {
                    continue;
                };
                for entry in list {
                    let Some(name) = entry.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    if catalog.get(name).is_some() {
                        continue;
                    }
                    catalog.elements.push(StoryElement {
                        name: name.to_string(),
                        kind: parse_element_kind(entry.get("kind").and_then(Value::as_str)),
                        description: entry
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        aliases: string_list(entry.get("aliases")),
                    });
                }
            }
        } else if catalog.get(key).is_none() {
            let kind = seeds
                .iter()
                .find(|s| s.name == *key)
                .map(|s| s.kind)
                .unwrap_or(ElementKind::Character);
            catalog.elements.push(StoryElement {
                name: key.clone(),
                kind,
                description: element_description(result),
                aliases: result_parts(result)
                    .into_iter()
                    .flat_map(|part| string_list(part.get("aliases")))
                    .collect(),
            });
        }
    }

    catalog
}

/// Best-effort description pulled from an extract unit's opaque result.
fn element_description(result: &Value) -> String {
    for part in result_parts(result) {
        if let Some(text) = part.get("description").and_then(Value::as_str) {
            return text.to_string();
        }
        if let Some(text) = part.as_str() {
            return text.to_string();
        }
    }
    result.to_string()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Project token usage and cost per unit, flagging units that will need
/// chunking. Pure; used for up-front cost reporting.
pub fn project_units(
    phase: Phase,
    keys: &[String],
    book: &ParsedBook,
    state: &PipelineState,
    config: &PipelineConfig,
    estimator: &TokenEstimator,
) -> Vec<UnitProjection> {
    keys.iter()
        .map(|key| {
            let input_tokens = match source_text(phase, key, book, state) {
                Some(text) => estimator.estimate(&text) + PROMPT_ENVELOPE_TOKENS,
                None => PROMPT_ENVELOPE_TOKENS,
            };
            let needs_chunking = estimator.will_exceed_limit(
                input_tokens,
                config.model.max_output_tokens,
                &config.model,
                config.token_safety_margin,
            ) || input_tokens > config.chunking.max_chunk_tokens;
            UnitProjection {
                key: key.clone(),
                input_tokens,
                cost: estimator.estimate_cost(
                    input_tokens,
                    config.model.max_output_tokens,
                    &config.model,
                ),
                needs_chunking,
            }
        })
        .collect()
}

/// Assemble the exact request payload for one unit, splitting the source
/// text into chunks when it would overflow the usable context window.
pub fn prepare_unit(
    phase: Phase,
    key: &str,
    book: &ParsedBook,
    state: &PipelineState,
    config: &PipelineConfig,
    estimator: &TokenEstimator,
) -> Result<PreparedUnit, PipelineError> {
    let text = source_text(phase, key, book, state).ok_or_else(|| PipelineError::Input {
        phase,
        reason: format!("no source material for unit {}", key),
    })?;

    // The chunk ceiling honors both the configured chunk size and the
    // model's usable window minus the envelope and reserved output.
    let window = (config.model.context_length as f64 * config.token_safety_margin) as u64;
    let usable = window
        .saturating_sub(PROMPT_ENVELOPE_TOKENS)
        .saturating_sub(config.model.max_output_tokens);
    let ceiling = config.chunking.max_chunk_tokens.min(usable).max(1);

    let plan = calculate_splits(&text, estimator, ceiling, config.chunking.overlap_chars);
    let total = plan.chunks.len();
    let prompts = plan
        .chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            render_prompt(phase, key, plan.slice(&text, chunk), index, total)
        })
        .collect();

    let approx_tokens = plan
        .chunks
        .iter()
        .map(|chunk| chunk.approx_tokens)
        .max()
        .unwrap_or(0);

    Ok(PreparedUnit {
        key: key.to_string(),
        prompts,
        oversized: plan.has_oversized(),
        approx_tokens,
    })
}

/// The raw material a unit's prompt is built from, per phase.
fn source_text(phase: Phase, key: &str, book: &ParsedBook, state: &PipelineState) -> Option<String> {
    match phase {
        Phase::Parse => None,
        Phase::Analyze => chapter_content(key, book),
        Phase::Extract => {
            let seeds = element_seeds_from_analyze(state);
            if seeds.is_empty() {
                chapter_content(key, book)
            } else {
                let seed = seeds.into_iter().find(|s| s.name == key)?;
                Some(format!(
                    "Element: {} ({:?})\nMentioned in chapters: {}\nNotes:\n{}",
                    seed.name,
                    seed.kind,
                    seed.mentions
                        .iter()
                        .map(u32::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                    seed.notes.join("\n"),
                ))
            }
        }
        Phase::Illustrate => {
            // Scene material from analyze, plus the element catalog for
            // consistent depictions.
            let analyze = state.phase(Phase::Analyze)?;
            let scenes = analyze.units.get(key)?.result.as_ref()?;
            let mut text = serde_json::to_string_pretty(scenes).ok()?;
            if let Some(catalog) = &state.elements {
                for element in &catalog.elements {
                    text.push_str(&format!("\n{}: {}", element.name, element.description));
                }
            }
            Some(text)
        }
    }
}

fn chapter_content(key: &str, book: &ParsedBook) -> Option<String> {
    let number = key.strip_prefix("chapter-")?.parse::<u32>().ok()?;
    book.chapter(number).map(|c| c.content.clone())
}

/// Render the instruction template around one chunk of source material.
fn render_prompt(phase: Phase, key: &str, material: &str, index: usize, total: usize) -> String {
    let part = if total > 1 {
        format!(" (part {} of {})", index + 1, total)
    } else {
        String::new()
    };
    match phase {
        Phase::Parse => String::new(),
        Phase::Analyze => format!(
            "Identify the key illustratable scenes in {}{}. For each scene give a \
             short description, a supporting quote, and the reasoning for its visual \
             interest. Also list the story elements (characters, places, items, \
             creatures) that appear.\n\n{}",
            key, part, material
        ),
        Phase::Extract => format!(
            "Write a canonical visual description for the following story element, \
             with any aliases it is known by{}.\n\n{}",
            part, material
        ),
        Phase::Illustrate => format!(
            "Produce an illustration brief for {}{} from the scene analysis and \
             element descriptions below.\n\n{}",
            key, part, material
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{BookMetadata, Chapter, PageRange};
    use serde_json::json;

    fn book(chapters: usize) -> ParsedBook {
        ParsedBook::new(
            BookMetadata {
                title: "The Book".into(),
                author: Some("A. Writer".into()),
                language: Some("en".into()),
                total_pages: 100,
                source_file: "book.epub".into(),
            },
            (1..=chapters as u32)
                .map(|n| Chapter {
                    number: n,
                    title: format!("Chapter {}", n),
                    pages: PageRange::new(n * 10, n * 10 + 9),
                    content: format!("The story continues in chapter {}.", n),
                    token_count: None,
                })
                .collect(),
        )
    }

    fn state_with_analyze_elements() -> PipelineState {
        let mut state = PipelineState::new("book.epub", "The Book", 100);
        for (key, elements) in [
            ("chapter-1", json!([{"name": "Mira", "kind": "character", "description": "a wary scout"}])),
            ("chapter-2", json!([{"name": "Mira", "kind": "character"}, {"name": "The Hollow", "kind": "place"}])),
        ] {
            let unit = state.phase_mut(Phase::Analyze).ensure_unit(key);
            unit.begin(key).expect("begin");
            unit.complete(key, json!({"scenes": [], "elements": elements}), 10)
                .expect("complete");
        }
        state
    }

    #[test]
    fn test_plan_chapter_phases() {
        let book = book(3);
        let state = PipelineState::new("b", "t", 100);
        let keys = plan_units(Phase::Analyze, &book, &state).expect("plan");
        assert_eq!(keys, vec!["chapter-1", "chapter-2", "chapter-3"]);
    }

    #[test]
    fn test_plan_rejects_empty_book() {
        let book = ParsedBook::new(
            BookMetadata {
                title: "t".into(),
                author: None,
                language: None,
                total_pages: 0,
                source_file: "b".into(),
            },
            Vec::new(),
        );
        let state = PipelineState::new("b", "t", 0);
        assert!(matches!(
            plan_units(Phase::Parse, &book, &state),
            Err(PipelineError::Input { .. })
        ));
    }

    #[test]
    fn test_extract_reuses_analyze_elements() {
        let book = book(2);
        let state = state_with_analyze_elements();
        let keys = plan_units(Phase::Extract, &book, &state).expect("plan");
        assert_eq!(keys, vec!["Mira", "The Hollow"]);
    }

    #[test]
    fn test_extract_falls_back_to_chapters() {
        let book = book(2);
        let state = PipelineState::new("b", "t", 100);
        let keys = plan_units(Phase::Extract, &book, &state).expect("plan");
        assert_eq!(keys, vec!["chapter-1", "chapter-2"]);
    }

    #[test]
    fn test_element_seeds_merge_mentions_and_notes() {
        let seeds = element_seeds_from_analyze(&state_with_analyze_elements());
        let mira = seeds.iter().find(|s| s.name == "Mira").expect("seed");
        assert_eq!(mira.kind, ElementKind::Character);
        assert_eq!(mira.mentions, vec![1, 2]);
        assert_eq!(mira.notes, vec!["a wary scout"]);
    }

    #[test]
    fn test_projection_flags_chunking() {
        let mut book = book(1);
        book.chapters[0].content = "word ".repeat(20_000);
        let state = PipelineState::new("b", "t", 100);
        let config = PipelineConfig::default().with_chunking(crate::config::ChunkingConfig {
            max_chunk_tokens: 1_000,
            overlap_chars: 50,
        });
        let estimator = TokenEstimator::default();
        let keys = vec!["chapter-1".to_string()];
        let projections =
            project_units(Phase::Analyze, &keys, &book, &state, &config, &estimator);
        assert!(projections[0].needs_chunking);
        assert!(projections[0].input_tokens > 1_000);
    }

    #[test]
    fn test_prepare_splits_oversized_chapter() {
        let mut book = book(1);
        book.chapters[0].content =
            "A plain sentence with several words in it. ".repeat(500);
        let state = PipelineState::new("b", "t", 100);
        let config = PipelineConfig::default().with_chunking(crate::config::ChunkingConfig {
            max_chunk_tokens: 500,
            overlap_chars: 40,
        });
        let prepared = prepare_unit(
            Phase::Analyze,
            "chapter-1",
            &book,
            &state,
            &config,
            &TokenEstimator::default(),
        )
        .expect("prepare");
        assert!(prepared.prompts.len() > 1);
        assert!(!prepared.oversized);
        assert!(prepared.prompts[0].contains("part 1 of"));
    }

    #[test]
    fn test_prepare_small_chapter_single_prompt() {
        let book = book(1);
        let state = PipelineState::new("b", "t", 100);
        let prepared = prepare_unit(
            Phase::Analyze,
            "chapter-1",
            &book,
            &state,
            &PipelineConfig::default(),
            &TokenEstimator::default(),
        )
        .expect("prepare");
        assert_eq!(prepared.prompts.len(), 1);
        assert!(prepared.prompts[0].contains("chapter 1"));
    }

    #[test]
    fn test_catalog_from_element_mode_units() {
        let mut state = state_with_analyze_elements();
        state.phase_mut(Phase::Analyze).status = crate::state::Status::Completed;
        for (key, result) in [
            ("Mira", json!({"description": "a wary scout with grey eyes", "aliases": ["the scout"]})),
            ("The Hollow", json!({"description": "a sunken forest clearing"})),
        ] {
            let unit = state.phase_mut(Phase::Extract).ensure_unit(key);
            unit.begin(key).expect("begin");
            unit.complete(key, result, 20).expect("complete");
        }

        let catalog = assemble_element_catalog(&state);
        assert_eq!(catalog.elements.len(), 2);
        let mira = catalog.get("Mira").expect("element");
        assert_eq!(mira.kind, ElementKind::Character);
        assert_eq!(mira.description, "a wary scout with grey eyes");
        assert_eq!(mira.aliases, vec!["the scout"]);
        assert_eq!(
            catalog.get("The Hollow").map(|e| e.kind),
            Some(ElementKind::Place)
        );
    }

    #[test]
    fn test_catalog_from_derive_mode_units() {
        let mut state = PipelineState::new("b", "t", 100);
        let unit = state.phase_mut(Phase::Extract).ensure_unit("chapter-1");
        unit.begin("chapter-1").expect("begin");
        unit.complete(
            "chapter-1",
            json!({"elements": [
                {"name": "Torin", "kind": "character", "description": "a blacksmith"},
                {"name": "Torin", "kind": "character", "description": "duplicate, ignored"},
            ]}),
            20,
        )
        .expect("complete");

        let catalog = assemble_element_catalog(&state);
        assert_eq!(catalog.elements.len(), 1);
        assert_eq!(
            catalog.get("Torin").map(|e| e.description.as_str()),
            Some("a blacksmith")
        );
    }

    #[test]
    fn test_catalog_skips_incomplete_units() {
        let mut state = PipelineState::new("b", "t", 100);
        let unit = state.phase_mut(Phase::Extract).ensure_unit("Mira");
        unit.begin("Mira").expect("begin");
        unit.fail("Mira", "rate limited", 5).expect("fail");
        assert!(assemble_element_catalog(&state).elements.is_empty());
    }

    #[test]
    fn test_prepare_unknown_unit_is_input_error() {
        let book = book(1);
        let state = PipelineState::new("b", "t", 100);
        assert!(matches!(
            prepare_unit(
                Phase::Analyze,
                "chapter-9",
                &book,
                &state,
                &PipelineConfig::default(),
                &TokenEstimator::default(),
            ),
            Err(PipelineError::Input { .. })
        ));
    }
}
