//! Default instructions and user-message builders.
//!
//! Prompt wording is configuration; everything here can be overridden from
//! the config file. The builders only add the positional context the model
//! needs to keep batches apart.

pub const DEFAULT_TRANSLATE_INSTRUCTIONS: &str = "\
You are an expert translator specializing in Japanese game dialogue to English. \
Provide accurate and engaging English translations that capture the original meaning, \
character voice, emotional tone, and context.

Translation guidelines:
- Maintain the unique voice and personality of each character.
- Convey hesitations (...), emphasis, and strong emotions using natural English expressions.
- Make sure the translation fits the game's narrative and situation.
- Prefer fluent, idiomatic English over literal renderings.

Output requirements:
- Return every input row, in the same order, with the same keys.
- Copy source fields unchanged and write the translation into the target field.";

pub const DEFAULT_TRANSLATE_PROMPT: &str = "\
Translate the following Japanese text to English.
Make the English translation sound natural while keeping the overall context in mind.
When translating, consider the character's personality and background when available.";

pub const DEFAULT_REFINE_INSTRUCTIONS: &str = "\
You are refining English translations of Japanese game dialogue. With the original \
Japanese text and the initial English translation provided, enhance naturalness and flow \
while keeping character voice and emotional tone. Avoid overly formal phrasing unless it \
matches the character's speaking style.";

pub const DEFAULT_REFINE_PROMPT: &str = "\
Refine the English translation of each row so it sounds more natural and engaging, \
keeping the overall context and character voice in mind.";

pub const DEFAULT_SPELL_CHECK_INSTRUCTIONS: &str = "\
You are an expert proofreader. Identify spelling and grammar mistakes in the provided \
text. Do not rewrite the text. For each item, describe the mistakes briefly, or answer \
exactly \"No errors found\" when the text is correct.";

pub const NO_ERRORS_FOUND: &str = "No errors found";

/// First column that looks like it names the speaking character.
pub fn detect_character_column<'a, I>(columns: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    columns.into_iter().find(|name| {
        let lower = name.to_lowercase();
        lower.contains("character") || lower.contains("name") || name.contains("キャラクター名")
    })
}

pub fn translate_instructions(
    base: &str,
    source_column: &str,
    target_column: &str,
    character_column: Option<&str>,
) -> String {
    let mut text = base.trim_end().to_string();
    text.push_str(&format!(
        "\n\nThe source text is in the \"{source_column}\" field. \
         Write the translation into the \"{target_column}\" field."
    ));
    if let Some(column) = character_column {
        text.push_str(&format!(
            " The \"{column}\" field names the character who is speaking."
        ));
    }
    text
}

pub fn refine_instructions(base: &str, target_column: &str, refined_column: &str) -> String {
    format!(
        "{}\n\nRead the translation from the \"{target_column}\" field and write the refined \
         version into the \"{refined_column}\" field.",
        base.trim_end()
    )
}

/// Positional header such as "rows 11 to 20 out of 95 total rows".
pub fn row_window(offset: usize, len: usize, total: usize) -> String {
    format!(
        "Here is the data (rows {} to {} out of {total} total rows):",
        offset + 1,
        offset + len
    )
}
