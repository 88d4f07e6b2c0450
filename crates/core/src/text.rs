use crate::lines::cluster_lines;
use crate::models::{ClusteringOptions, PageTokens, TextPage};

#[derive(Debug, Clone, Copy, Default)]
pub struct TextExtractor {
    options: ClusteringOptions,
}

impl TextExtractor {
    pub fn new(options: ClusteringOptions) -> Self {
        Self { options }
    }

    pub fn extract_page(&self, page: &PageTokens) -> TextPage {
        let text = cluster_lines(&page.tokens, page.height, &self.options)
            .into_iter()
            .map(|line| line.text)
            .collect::<Vec<_>>()
            .join("\n");

        TextPage {
            page_number: page.number,
            width: page.width,
            height: page.height,
            text,
        }
    }
}
