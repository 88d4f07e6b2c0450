use crate::lines::{cluster_lines, Line};
use crate::models::{BoundingBox, ClusteringOptions, LayoutPage, PageTokens, RegionKind, VisualRegion};
use uuid::Uuid;

pub trait RegionClassifier: Send + Sync {
    fn classify(&self, page: &PageTokens, region: &VisualRegion) -> RegionKind;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UniformClassifier;

impl RegionClassifier for UniformClassifier {
    fn classify(&self, _page: &PageTokens, _region: &VisualRegion) -> RegionKind {
        RegionKind::Other
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutAnalyzer {
    options: ClusteringOptions,
}

impl LayoutAnalyzer {
    pub fn new(options: ClusteringOptions) -> Self {
        Self { options }
    }

    pub fn analyze_page(&self, page: &PageTokens) -> LayoutPage {
        let regions = cluster_lines(&page.tokens, page.height, &self.options)
            .iter()
            .map(|line| VisualRegion {
                id: Uuid::new_v4().to_string(),
                page_number: page.number,
                kind: RegionKind::Other,
                bbox: line_bbox(line, page.width, page.height, &self.options),
            })
            .collect();

        LayoutPage {
            page_number: page.number,
            width: page.width,
            height: page.height,
            regions,
        }
    }

    pub fn classify_page(&self, page: &PageTokens, classifier: &dyn RegionClassifier) -> LayoutPage {
        let mut layout = self.analyze_page(page);
        for region in &mut layout.regions {
            region.kind = classifier.classify(page, region);
        }
        layout
    }
}

fn line_bbox(line: &Line<'_>, page_width: f32, page_height: f32, options: &ClusteringOptions) -> BoundingBox {
    let mut min_x = f32::INFINITY;
    let mut max_x = f32::NEG_INFINITY;
    let mut min_y = f32::INFINITY;
    let mut max_y = f32::NEG_INFINITY;

    for token in &line.tokens {
        min_x = min_x.min(token.x).min(token.x + token.width);
        max_x = max_x.max(token.x).max(token.x + token.width);
        min_y = min_y.min(token.y).min(token.y + token.height);
        max_y = max_y.max(token.y).max(token.y + token.height);
    }

    let width = if page_width > 0.0 { page_width } else { 1.0 };
    let height = if page_height > 0.0 { page_height } else { 1.0 };
    let padding = options.vertical_padding_ratio;

    let x0 = clamp_unit(min_x / width);
    let x1 = clamp_unit(max_x / width);
    let y0 = clamp_unit(1.0 - max_y / height - padding);
    let y1 = clamp_unit(1.0 - min_y / height + padding);

    BoundingBox {
        x0: x0.min(x1),
        y0: y0.min(y1),
        x1: x0.max(x1),
        y1: y0.max(y1),
    }
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lines::token;
    use crate::models::PageToken;
    use crate::text::TextExtractor;

    fn sample_page() -> PageTokens {
        PageTokens {
            number: 1,
            width: 600.0,
            height: 800.0,
            tokens: vec![
                token("Title", 60.0, 700.0),
                token("first ", 60.0, 600.0),
                token("line", 96.0, 600.0),
                token("second", 60.0, 500.0),
                token("  ", 60.0, 400.0),
            ],
        }
    }

    #[test]
    fn region_count_matches_text_line_count() {
        let page = sample_page();
        let layout = LayoutAnalyzer::default().analyze_page(&page);
        let text = TextExtractor::default().extract_page(&page);

        assert_eq!(layout.regions.len(), text.text.lines().count());
        assert_eq!(layout.regions.len(), 3);
    }

    #[test]
    fn regions_are_in_reading_order_with_unique_ids() {
        let layout = LayoutAnalyzer::default().analyze_page(&sample_page());

        for pair in layout.regions.windows(2) {
            assert!(pair[0].bbox.y0 < pair[1].bbox.y0);
            assert_ne!(pair[0].id, pair[1].id);
        }
        assert!(layout.regions.iter().all(|region| region.kind == RegionKind::Other));
    }

    struct WideLinesAreTables;

    impl RegionClassifier for WideLinesAreTables {
        fn classify(&self, _page: &PageTokens, region: &VisualRegion) -> RegionKind {
            if region.bbox.x1 - region.bbox.x0 > 0.08 {
                RegionKind::Table
            } else {
                RegionKind::Other
            }
        }
    }

    #[test]
    fn classifier_sets_kinds_without_moving_regions() {
        let page = sample_page();
        let analyzer = LayoutAnalyzer::default();

        let uniform = analyzer.classify_page(&page, &UniformClassifier);
        assert!(uniform.regions.iter().all(|region| region.kind == RegionKind::Other));

        let classified = analyzer.classify_page(&page, &WideLinesAreTables);
        let kinds = classified.regions.iter().map(|region| region.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![RegionKind::Other, RegionKind::Table, RegionKind::Other]);

        let boxes = |layout: &LayoutPage| layout.regions.iter().map(|region| region.bbox).collect::<Vec<_>>();
        assert_eq!(boxes(&uniform), boxes(&classified));
    }

    #[test]
    fn bbox_is_normalized_flipped_and_padded() {
        let layout = LayoutAnalyzer::default().analyze_page(&sample_page());
        let title = layout.regions[0].bbox;

        // token spans x 60..90, y 700..710 on a 600x800 page
        assert!((title.x0 - 0.1).abs() < 1e-5);
        assert!((title.x1 - 0.15).abs() < 1e-5);
        assert!((title.y0 - (1.0 - 710.0 / 800.0 - 0.004)).abs() < 1e-5);
        assert!((title.y1 - (1.0 - 700.0 / 800.0 + 0.004)).abs() < 1e-5);
    }

    #[test]
    fn boxes_are_clamped_to_the_unit_square() {
        let page = PageTokens {
            number: 1,
            width: 100.0,
            height: 100.0,
            tokens: vec![
                PageToken {
                    text: "overflow".to_string(),
                    x: -20.0,
                    y: 99.0,
                    width: 200.0,
                    height: 12.0,
                },
                PageToken {
                    text: "floor".to_string(),
                    x: 10.0,
                    y: 0.0,
                    width: 20.0,
                    height: 0.1,
                },
            ],
        };

        let layout = LayoutAnalyzer::default().analyze_page(&page);
        assert_eq!(layout.regions.len(), 2);
        for region in &layout.regions {
            assert!(region.bbox.is_normalized(), "{:?}", region.bbox);
        }
        assert_eq!(layout.regions[0].bbox.x0, 0.0);
        assert_eq!(layout.regions[0].bbox.y0, 0.0);
        assert_eq!(layout.regions[1].bbox.y1, 1.0);
    }
}
