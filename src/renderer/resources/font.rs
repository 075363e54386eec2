//! Bitmap fonts stored as a 16x16 grid of glyph cells covering code points 0-255.

use glam::{Vec2, Vec4};
use crate::renderer::resources::texture::StagedTexture;

pub const GRID: u32 = 16;
/// Advance of glyphs without coverage, in cell widths
const SPACE_ADVANCE: f32 = 0.3;
/// Gap between glyphs, in cell widths
const LETTER_SPACING: f32 = 0.08;
const ALPHA_THRESHOLD: u8 = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Glyph {
    /// Left edge of the inked area, in cell widths
    pub left: f32,
    /// Width of the inked area, zero for blank cells
    pub width: f32,
}

impl Glyph {
    pub fn advance(&self) -> f32 {
        if self.width > 0.0 {
            self.width + LETTER_SPACING
        } else {
            SPACE_ADVANCE
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BitmapFont {
    /// Pool-local texture index of the atlas
    pub texture: u32,
    glyphs: Vec<Glyph>,
    /// Substitute for an atlas that failed to load, measures and draws nothing
    blank: bool,
}

/// One glyph of a laid out string. Units are multiples of the font size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacedGlyph {
    pub offset: Vec2,
    pub size: Vec2,
    /// Atlas region as `(x, y, width, height)` in uv space
    pub region: Vec4,
}

impl BitmapFont {
    /// Measures every cell of `atlas`
    pub fn from_atlas(texture: u32, atlas: &StagedTexture) -> Self {
        let cell_w = (atlas.width / GRID).max(1);
        let cell_h = (atlas.height / GRID).max(1);
        let glyphs = (0..GRID * GRID)
            .map(|code| {
                let x0 = (code % GRID) * cell_w;
                let y0 = (code / GRID) * cell_h;
                let inked = (0..cell_w).filter(|&x| {
                    (0..cell_h).any(|y| {
                        let (px, py) = (x0 + x, y0 + y);
                        let i = ((py * atlas.width + px) * 4 + 3) as usize;
                        px < atlas.width
                            && py < atlas.height
                            && atlas.rgba.get(i).is_some_and(|&a| a > ALPHA_THRESHOLD)
                    })
                });
                let (first, last) = inked.fold((None, 0), |(first, _), x| (first.or(Some(x)), x));
                match first {
                    Some(first) => Glyph {
                        left: first as f32 / cell_w as f32,
                        width: (last - first + 1) as f32 / cell_w as f32,
                    },
                    None => Glyph::default(),
                }
            })
            .collect();
        Self {
            texture,
            glyphs,
            blank: false,
        }
    }

    /// A font whose glyphs are all blank, substituted when loading fails
    pub fn blank(texture: u32) -> Self {
        Self {
            texture,
            glyphs: vec![Glyph::default(); (GRID * GRID) as usize],
            blank: true,
        }
    }

    pub fn glyph(&self, c: char) -> Glyph {
        let code = if (c as u32) < GRID * GRID { c as u32 } else { '?' as u32 };
        self.glyphs[code as usize]
    }

    fn advance(&self, glyph: Glyph) -> f32 {
        if self.blank { 0.0 } else { glyph.advance() }
    }

    pub fn measure(&self, text: &str) -> f32 {
        text.chars().map(|c| self.advance(self.glyph(c))).sum()
    }

    /// Lays out `text` left to right starting at the origin
    pub fn layout(&self, text: &str) -> Vec<PlacedGlyph> {
        let cell = 1.0 / GRID as f32;
        let mut x = 0.0;
        let mut placed = Vec::new();
        for c in text.chars() {
            let glyph = self.glyph(c);
            if glyph.width > 0.0 {
                let code = c as u32;
                let code = if code < GRID * GRID { code } else { '?' as u32 };
                let col = (code % GRID) as f32;
                let row = (code / GRID) as f32;
                placed.push(PlacedGlyph {
                    offset: Vec2::new(x, 0.0),
                    size: Vec2::new(glyph.width, 1.0),
                    region: Vec4::new(
                        (col + glyph.left) * cell,
                        row * cell,
                        glyph.width * cell,
                        cell,
                    ),
                });
            }
            x += self.advance(glyph);
        }
        placed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// 64x64 atlas, 4x4 cells. 'A' is inked in columns 1..=2, 'I' in column 2.
    fn atlas() -> StagedTexture {
        let (width, height) = (64u32, 64u32);
        let mut rgba = vec![0u8; (width * height * 4) as usize];
        let mut ink = |code: u32, columns: std::ops::RangeInclusive<u32>| {
            let (x0, y0) = ((code % GRID) * 4, (code / GRID) * 4);
            for x in columns {
                let i = (((y0 + 1) * width + x0 + x) * 4 + 3) as usize;
                rgba[i] = 255;
            }
        };
        ink('A' as u32, 1..=2);
        ink('I' as u32, 2..=2);
        StagedTexture { width, height, rgba }
    }

    #[test]
    fn glyph_width_comes_from_coverage() {
        let font = BitmapFont::from_atlas(0, &atlas());
        let a = font.glyph('A');
        assert_relative_eq!(a.left, 0.25);
        assert_relative_eq!(a.width, 0.5);
        assert_relative_eq!(font.glyph('I').width, 0.25);
        assert_eq!(font.glyph(' '), Glyph::default());
    }

    #[test]
    fn measure_sums_advances() {
        let font = BitmapFont::from_atlas(0, &atlas());
        let expected = (0.5 + LETTER_SPACING) + SPACE_ADVANCE + (0.25 + LETTER_SPACING);
        assert_relative_eq!(font.measure("A I"), expected);
    }

    #[test]
    fn layout_skips_blank_glyphs() {
        let font = BitmapFont::from_atlas(0, &atlas());
        let placed = font.layout("A I");
        assert_eq!(placed.len(), 2);
        assert_relative_eq!(placed[1].offset.x, 0.5 + LETTER_SPACING + SPACE_ADVANCE);
        let cell = 1.0 / 16.0;
        assert_relative_eq!(placed[0].region.x, (('A' as u32 % 16) as f32 + 0.25) * cell);
        assert_relative_eq!(placed[0].region.y, ('A' as u32 / 16) as f32 * cell);
    }

    #[test]
    fn characters_outside_the_grid_use_question_mark() {
        let font = BitmapFont::from_atlas(0, &atlas());
        assert_eq!(font.glyph('\u{2603}'), font.glyph('?'));
    }

    #[test]
    fn blank_font_has_no_width() {
        let font = BitmapFont::blank(3);
        assert_eq!(font.texture, 3);
        assert_eq!(font.measure("a b c"), 0.0);
        assert!(font.layout("a b c").is_empty());
    }
}
