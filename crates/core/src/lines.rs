use crate::models::{ClusteringOptions, PageToken};
use std::cmp::Ordering;

#[derive(Debug, Clone)]
pub struct Line<'a> {
    pub tokens: Vec<&'a PageToken>,
    pub text: String,
}

pub fn reading_order(tokens: &[PageToken]) -> Vec<&PageToken> {
    let mut ordered = tokens.iter().collect::<Vec<_>>();
    ordered.sort_by(|left, right| match right.y.total_cmp(&left.y) {
        Ordering::Equal => left.x.total_cmp(&right.x),
        other => other,
    });
    ordered
}

pub fn line_threshold(page_height: f32, options: &ClusteringOptions) -> f32 {
    page_height * options.line_threshold_ratio
}

// Groups tokens into lines. A token joins the current line when its distance to the
// mean `y` of every token already in that line is within the threshold. Lines whose
// trimmed text is empty are dropped.
pub fn cluster_lines<'a>(
    tokens: &'a [PageToken],
    page_height: f32,
    options: &ClusteringOptions,
) -> Vec<Line<'a>> {
    let threshold = line_threshold(page_height, options);
    let mut groups: Vec<Vec<&'a PageToken>> = Vec::new();
    let mut current: Vec<&'a PageToken> = Vec::new();
    let mut mean_y = 0f32;

    for token in reading_order(tokens) {
        if current.is_empty() {
            mean_y = token.y;
            current.push(token);
            continue;
        }

        if (token.y - mean_y).abs() <= threshold {
            current.push(token);
            mean_y += (token.y - mean_y) / current.len() as f32;
        } else {
            groups.push(std::mem::take(&mut current));
            mean_y = token.y;
            current.push(token);
        }
    }

    if !current.is_empty() {
        groups.push(current);
    }

    groups
        .into_iter()
        .filter_map(|tokens| {
            let text = tokens
                .iter()
                .map(|token| token.text.as_str())
                .collect::<String>()
                .trim()
                .to_string();

            if text.is_empty() {
                None
            } else {
                Some(Line { tokens, text })
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn token(text: &str, x: f32, y: f32) -> PageToken {
    PageToken {
        text: text.to_string(),
        x,
        y,
        width: 6.0 * text.chars().count() as f32,
        height: 10.0,
    }
}
