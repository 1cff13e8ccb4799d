//! Prompt segments ordered from most to least stable.
//!
//! Backends that support prompt caching place a cache breakpoint after every
//! cacheable segment, so the stable prefix is reused across requests that
//! share it. The per-item request is always last and never cached.

use crate::item::Item;
use crate::models::Mode;
use crate::profile::Profile;

pub const SYSTEM_PROMPT: &str = "You are a professional style analyst specializing in personalized clothing recommendations.

Your role is to analyze clothing products and provide detailed, personalized style guidance based on user preferences and product characteristics.

Key Responsibilities:
1. Evaluate how well a product matches the user's style preferences
2. Provide detailed analysis of fit, versatility, and styling potential
3. Suggest specific outfit combinations and styling tips
4. Identify any potential concerns or limitations
5. Give honest, actionable recommendations

Analysis Approach:
- Be specific and practical in your recommendations
- Consider the user's body type, style goals, and lifestyle
- Focus on versatility and how the item integrates into their wardrobe
- Highlight both strengths and potential limitations
- Provide concrete styling suggestions with specific garment pairings

Tone:
- Professional but friendly
- Honest and direct
- Helpful and encouraging
- Avoid generic fashion cliches
- Use clear, accessible language";

pub const BASIC_SYSTEM_PROMPT: &str = "You are a professional style analyst providing general clothing recommendations.

Your role is to analyze clothing products and provide objective style guidance.

Key Responsibilities:
1. Evaluate the product's overall style and quality
2. Assess versatility and styling potential
3. Suggest general outfit combinations
4. Identify strengths and limitations
5. Give honest, actionable recommendations

Analysis Approach:
- Be specific and practical
- Focus on versatility and value
- Provide concrete styling suggestions
- Highlight both strengths and limitations
- Consider general body type compatibility

Tone:
- Professional but friendly
- Honest and direct
- Helpful and encouraging
- Use clear, accessible language";

pub const ANALYSIS_SCHEMA: &str = r#"EXPECTED RESPONSE FORMAT:

Provide your analysis as a valid JSON object with the following structure:

{
  "style_match_score": <number 0-100>,
  "match_reasoning": "<brief explanation of the score>",

  "fit_analysis": {
    "expected_fit": "<description of how it will fit>",
    "body_type_suitability": "<how it works with user's body type>",
    "sizing_notes": "<any sizing considerations>"
  },

  "versatility_score": <number 0-100>,
  "versatility_notes": "<explanation of versatility>",

  "outfit_suggestions": [
    {
      "occasion": "<e.g., casual, work, going out>",
      "pairing": "<specific items to pair with>",
      "styling_tips": "<how to style this combination>"
    }
  ],

  "pros": [
    "<positive aspect 1>",
    "<positive aspect 2>"
  ],

  "cons": [
    "<concern or limitation 1>",
    "<concern or limitation 2>"
  ],

  "overall_recommendation": "<buy/consider/pass>",
  "final_thoughts": "<concise summary and recommendation>"
}

Requirements:
- All scores must be integers between 0-100
- Provide at least 2-3 outfit suggestions
- List at least 2 pros and 2 cons (or 1 if minimal)
- Be specific in your recommendations
- Ensure valid JSON format (no trailing commas, proper escaping)
- Keep outfit suggestions practical and specific"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub label: String,
    pub text: String,
    pub cacheable: bool,
}

impl Segment {
    fn stable(label: &str, text: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            text: text.into(),
            cacheable: true,
        }
    }
}

/// A fully assembled request: stable segments in order, then the volatile
/// per-item text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPlan {
    pub mode: Mode,
    pub stable: Vec<Segment>,
    pub volatile: String,
}

impl PromptPlan {
    /// Instructions, then the profile, then the output schema; item last.
    pub fn full(item: &Item, profile: &Profile) -> Self {
        Self {
            mode: Mode::Full,
            stable: vec![
                Segment::stable("instructions", SYSTEM_PROMPT),
                Segment::stable("profile", profile.prompt_text()),
                Segment::stable("schema", ANALYSIS_SCHEMA),
            ],
            volatile: item.prompt_text(Mode::Full),
        }
    }

    pub fn basic(item: &Item) -> Self {
        Self {
            mode: Mode::Basic,
            stable: vec![
                Segment::stable("instructions", BASIC_SYSTEM_PROMPT),
                Segment::stable("schema", ANALYSIS_SCHEMA),
            ],
            volatile: item.prompt_text(Mode::Basic),
        }
    }

    /// Fit the cacheable segments into `max_breakpoints`; see
    /// [`cap_breakpoints`].
    pub fn capped(mut self, max_breakpoints: usize) -> Self {
        self.stable = cap_breakpoints(self.stable, max_breakpoints);
        self
    }

    pub fn breakpoint_count(&self) -> usize {
        self.stable.iter().filter(|s| s.cacheable).count()
    }
}

/// Merge adjacent cacheable segments until at most `max` remain.
///
/// The smallest adjacent pair is merged first so the large, most reusable
/// prefixes keep their own breakpoints. Segment order and text are preserved;
/// nothing is dropped.
pub fn cap_breakpoints(mut segments: Vec<Segment>, max: usize) -> Vec<Segment> {
    let max = max.max(1);
    loop {
        let cacheable = segments.iter().filter(|s| s.cacheable).count();
        if cacheable <= max {
            return segments;
        }

        let smallest = segments
            .windows(2)
            .enumerate()
            .filter(|(_, pair)| pair[0].cacheable && pair[1].cacheable)
            .min_by_key(|(_, pair)| pair[0].text.len() + pair[1].text.len())
            .map(|(idx, _)| idx);

        let Some(idx) = smallest else {
            // No adjacent cacheable pair; demote the smallest instead of dropping it.
            if let Some(seg) = segments
                .iter_mut()
                .filter(|s| s.cacheable)
                .min_by_key(|s| s.text.len())
            {
                seg.cacheable = false;
            }
            continue;
        };

        let second = segments.remove(idx + 1);
        let first = &mut segments[idx];
        first.label = format!("{}+{}", first.label, second.label);
        first.text = format!("{}\n\n{}", first.text, second.text);
    }
}
