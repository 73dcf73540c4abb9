//! styles.xml reader: resolves each `cellXfs` entry into a [`Style`].
//!
//! Theme colors are mapped to the default Office theme without tint math.

use std::collections::HashMap;

use cellbook_engine::conditional::StyleOverride;
use cellbook_engine::style::{
    builtin_number_format, Border, BorderStyle, Borders, Color, DiagonalDirection, Fill, FillPattern, Font, HAlign,
    Style, Underline, VAlign,
};
use ordered_float::OrderedFloat;
use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{IoError, Result};

/// Legacy indexed palette (indices 0..=63)
const INDEXED: [u32; 64] = [
    0x000000, 0xFFFFFF, 0xFF0000, 0x00FF00, 0x0000FF, 0xFFFF00, 0xFF00FF, 0x00FFFF,
    0x000000, 0xFFFFFF, 0xFF0000, 0x00FF00, 0x0000FF, 0xFFFF00, 0xFF00FF, 0x00FFFF,
    0x800000, 0x008000, 0x000080, 0x808000, 0x800080, 0x008080, 0xC0C0C0, 0x808080,
    0x9999FF, 0x993366, 0xFFFFCC, 0xCCFFFF, 0x660066, 0xFF8080, 0x0066CC, 0xCCCCFF,
    0x000080, 0xFF00FF, 0xFFFF00, 0x00FFFF, 0x800080, 0x800000, 0x008080, 0x0000FF,
    0x00CCFF, 0xCCFFFF, 0xCCFFCC, 0xFFFF99, 0x99CCFF, 0xFF99CC, 0xCC99FF, 0xFFCC99,
    0x3366FF, 0x33CCCC, 0x99CC00, 0xFFCC00, 0xFF9900, 0xFF6600, 0x666699, 0x969696,
    0x003366, 0x339966, 0x003300, 0x333300, 0x993300, 0x993333, 0x333399, 0x333333,
];

/// Default Office theme: lt1, dk1, lt2, dk2, accent1..6
const THEME: [u32; 10] = [
    0xFFFFFF, 0x000000, 0xEEECE1, 0x1F497D, 0x4F81BD, 0xC0504D, 0x9BBB59, 0x8064A2, 0x4BACC6, 0xF79646,
];

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    Other,
    Fonts,
    Fills,
    Borders,
    CellXfs,
    Dxfs,
}

/// Resolved styles.xml
#[derive(Debug, Default)]
pub(crate) struct StyleSheet {
    /// One entry per `cellXfs` index
    pub cell_styles: Vec<Style>,
    /// Differential formats referenced by conditional formatting
    pub dxfs: Vec<StyleOverride>,
}

#[derive(Default)]
struct Tables {
    num_fmts: HashMap<u16, String>,
    fonts: Vec<Font>,
    fills: Vec<Fill>,
    borders: Vec<Borders>,
    styles: Vec<Style>,
    dxfs: Vec<StyleOverride>,
}

pub(crate) fn parse_styles(xml: &str) -> Result<StyleSheet> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut t = Tables::default();
    let mut section = Section::Other;
    let mut font = Font::default();
    let mut fill = Fill::default();
    let mut borders = Borders::default();
    // Edge whose children are being read inside <border>
    let mut edge: Option<Vec<u8>> = None;
    let mut dxf = StyleOverride::default();
    // font, fill or border element inside the current <dxf>
    let mut part: Vec<u8> = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(IoError::corrupt)?;
        let empty = matches!(event, Event::Empty(_));
        match &event {
            Event::Start(e) | Event::Empty(e) => {
                let name = e.local_name().as_ref().to_vec();
                match (section, name.as_slice()) {
                    (Section::Dxfs, b"numFmt") => dxf.number_format = attr(e, b"formatCode"),
                    (_, b"numFmt") => {
                        if let (Some(id), Some(code)) = (attr(e, b"numFmtId"), attr(e, b"formatCode")) {
                            if let Ok(id) = id.parse() {
                                t.num_fmts.insert(id, code);
                            }
                        }
                    }
                    (_, b"fonts") if !empty => section = Section::Fonts,
                    (_, b"fills") if !empty => section = Section::Fills,
                    (_, b"borders") if !empty => section = Section::Borders,
                    (_, b"cellXfs") if !empty => section = Section::CellXfs,
                    (_, b"dxfs") if !empty => section = Section::Dxfs,

                    (Section::Fonts, b"font") => {
                        font = Font::default();
                        if empty {
                            t.fonts.push(font.clone());
                        }
                    }
                    (Section::Fonts, b"b") => font.bold = flag(e),
                    (Section::Fonts, b"i") => font.italic = flag(e),
                    (Section::Fonts, b"strike") => font.strikethrough = flag(e),
                    (Section::Fonts, b"u") => font.underline = underline(e),
                    (Section::Fonts, b"sz") => {
                        if let Some(size) = attr(e, b"val").and_then(|v| v.parse::<f64>().ok()) {
                            font.size = OrderedFloat(size);
                        }
                    }
                    (Section::Fonts, b"name") => {
                        if let Some(name) = attr(e, b"val") {
                            font.name = name;
                        }
                    }
                    (Section::Fonts, b"color") => font.color = parse_color(e).filter(|&c| c != Color::BLACK),

                    (Section::Fills, b"fill") => {
                        fill = Fill::default();
                        if empty {
                            t.fills.push(fill.clone());
                        }
                    }
                    (Section::Fills, b"patternFill") => {
                        fill.pattern = pattern(attr(e, b"patternType").as_deref().unwrap_or("none"));
                    }
                    (Section::Fills, b"fgColor") => fill.fg_color = parse_color(e),
                    (Section::Fills, b"bgColor") => fill.bg_color = parse_color(e),

                    (Section::Borders, b"border") => {
                        borders = Borders::default();
                        let up = attr(e, b"diagonalUp").is_some_and(|v| v == "1" || v == "true");
                        let down = attr(e, b"diagonalDown").is_some_and(|v| v == "1" || v == "true");
                        borders.diagonal_direction = match (up, down) {
                            (true, true) => DiagonalDirection::Both,
                            (true, false) => DiagonalDirection::Up,
                            (false, true) => DiagonalDirection::Down,
                            (false, false) => DiagonalDirection::None,
                        };
                        if empty {
                            t.borders.push(borders);
                        }
                    }
                    (Section::Borders, b"left" | b"start" | b"right" | b"end" | b"top" | b"bottom" | b"diagonal") => {
                        let style = border_style(attr(e, b"style").as_deref().unwrap_or("none"));
                        if let Some(side) = edge_mut(&mut borders, &name) {
                            *side = Border { style, color: None };
                        }
                        edge = (!empty).then(|| name.clone());
                    }
                    (Section::Borders, b"color") => {
                        let color = parse_color(e);
                        if let Some(side) = edge.as_deref().and_then(|n| edge_mut(&mut borders, n)) {
                            side.color = color;
                        }
                    }

                    (Section::CellXfs, b"xf") => {
                        t.styles.push(resolve_xf(e, &t));
                    }
                    (Section::CellXfs, b"alignment") => {
                        if let Some(style) = t.styles.last_mut() {
                            apply_alignment(e, style);
                        }
                    }

                    (Section::Dxfs, b"dxf") => {
                        dxf = StyleOverride::default();
                        if empty {
                            t.dxfs.push(dxf.clone());
                        }
                    }
                    (Section::Dxfs, b"font" | b"fill" | b"border") => part = name.clone(),
                    (Section::Dxfs, b"b") => dxf.bold = Some(flag(e)),
                    (Section::Dxfs, b"i") => dxf.italic = Some(flag(e)),
                    (Section::Dxfs, b"strike") => dxf.strikethrough = Some(flag(e)),
                    (Section::Dxfs, b"u") => dxf.underline = Some(underline(e)),
                    (Section::Dxfs, b"color") if part == b"font" => dxf.font_color = parse_color(e),
                    (Section::Dxfs, b"color") => {
                        if let Some(border) = dxf.border.as_mut() {
                            border.color = parse_color(e);
                        }
                    }
                    (Section::Dxfs, b"patternFill") => {
                        match pattern(attr(e, b"patternType").as_deref().unwrap_or("solid")) {
                            FillPattern::None | FillPattern::Solid => {}
                            p => dxf.fill_pattern = Some(p),
                        }
                    }
                    (Section::Dxfs, b"fgColor" | b"bgColor") => {
                        if dxf.fill_color.is_none() {
                            dxf.fill_color = parse_color(e);
                        }
                    }
                    (Section::Dxfs, b"left" | b"start" | b"right" | b"end" | b"top" | b"bottom") => {
                        let style = border_style(attr(e, b"style").as_deref().unwrap_or("none"));
                        if style != BorderStyle::None && dxf.border.is_none() {
                            dxf.border = Some(Border { style, color: None });
                        }
                    }
                    _ => {}
                }
            }
            Event::End(e) => match (section, e.local_name().as_ref()) {
                (Section::Fonts, b"font") => t.fonts.push(font.clone()),
                (Section::Fills, b"fill") => t.fills.push(fill.clone()),
                (Section::Borders, b"border") => t.borders.push(borders),
                (Section::Borders, b"left" | b"start" | b"right" | b"end" | b"top" | b"bottom" | b"diagonal") => {
                    edge = None
                }
                (Section::Dxfs, b"dxf") => t.dxfs.push(dxf.clone()),
                (_, b"fonts" | b"fills" | b"borders" | b"cellXfs" | b"dxfs") => section = Section::Other,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(StyleSheet { cell_styles: t.styles, dxfs: t.dxfs })
}

fn resolve_xf(e: &BytesStart, t: &Tables) -> Style {
    let index = |key: &[u8]| attr(e, key).and_then(|v| v.parse::<usize>().ok()).unwrap_or(0);
    let mut style = Style {
        font: t.fonts.get(index(b"fontId")).cloned().unwrap_or_default(),
        fill: t.fills.get(index(b"fillId")).cloned().unwrap_or_default(),
        borders: t.borders.get(index(b"borderId")).copied().unwrap_or_default(),
        ..Style::default()
    };
    // The second reserved fill (gray125) is a placeholder, not a visible fill
    if style.fill.pattern == FillPattern::Gray125 && index(b"fillId") == 1 {
        style.fill = Fill::default();
    }
    let fmt_id = index(b"numFmtId") as u16;
    if fmt_id != 0 {
        if let Some(code) = t.num_fmts.get(&fmt_id).cloned().or_else(|| builtin_number_format(fmt_id).map(String::from)) {
            style.number_format = code;
        }
    }
    style
}

fn apply_alignment(e: &BytesStart, style: &mut Style) {
    let align = &mut style.alignment;
    align.horizontal = match attr(e, b"horizontal").as_deref() {
        Some("left") => HAlign::Left,
        Some("center") => HAlign::Center,
        Some("right") => HAlign::Right,
        Some("fill") => HAlign::Fill,
        Some("justify") | Some("distributed") => HAlign::Justify,
        Some("centerContinuous") => HAlign::CenterAcross,
        _ => HAlign::General,
    };
    align.vertical = match attr(e, b"vertical").as_deref() {
        Some("top") => VAlign::Top,
        Some("center") => VAlign::Center,
        Some("justify") | Some("distributed") => VAlign::Justify,
        _ => VAlign::Bottom,
    };
    align.wrap_text = attr(e, b"wrapText").is_some_and(|v| v == "1" || v == "true");
    align.indent = attr(e, b"indent").and_then(|v| v.parse().ok()).unwrap_or(0);
    // 91..=180 encode downward angles; 255 (stacked) has no counterpart
    align.rotation = match attr(e, b"textRotation").and_then(|v| v.parse::<i16>().ok()) {
        Some(r @ 0..=90) => r,
        Some(r @ 91..=180) => 90 - r,
        _ => 0,
    };
}

fn edge_mut<'a>(borders: &'a mut Borders, name: &[u8]) -> Option<&'a mut Border> {
    match name {
        b"left" | b"start" => Some(&mut borders.left),
        b"right" | b"end" => Some(&mut borders.right),
        b"top" => Some(&mut borders.top),
        b"bottom" => Some(&mut borders.bottom),
        b"diagonal" => Some(&mut borders.diagonal),
        _ => None,
    }
}

fn border_style(s: &str) -> BorderStyle {
    match s {
        "thin" => BorderStyle::Thin,
        "medium" | "mediumDashed" | "mediumDashDot" | "mediumDashDotDot" | "slantDashDot" => BorderStyle::Medium,
        "thick" => BorderStyle::Thick,
        "dashed" | "dashDot" | "dashDotDot" => BorderStyle::Dashed,
        "dotted" => BorderStyle::Dotted,
        "double" => BorderStyle::Double,
        "hair" => BorderStyle::Hair,
        _ => BorderStyle::None,
    }
}

fn pattern(s: &str) -> FillPattern {
    match s {
        "solid" => FillPattern::Solid,
        "mediumGray" | "darkGray" => FillPattern::Gray50,
        "lightGray" => FillPattern::Gray25,
        "gray125" | "gray0625" => FillPattern::Gray125,
        "darkHorizontal" | "lightHorizontal" => FillPattern::HorizontalStripe,
        "darkVertical" | "lightVertical" => FillPattern::VerticalStripe,
        "darkDown" | "darkUp" | "lightDown" | "lightUp" => FillPattern::DiagonalStripe,
        "darkGrid" | "lightGrid" | "darkTrellis" | "lightTrellis" => FillPattern::DiagonalCrosshatch,
        _ => FillPattern::None,
    }
}

/// Color from `rgb`, `indexed` or `theme` attributes, in that order of preference.
pub(crate) fn parse_color(e: &BytesStart) -> Option<Color> {
    if let Some(hex) = attr(e, b"rgb") {
        let hex = hex.trim_start_matches('#');
        let rgb = if hex.len() == 8 { &hex[2..] } else { hex };
        return u32::from_str_radix(rgb, 16).ok().map(Color::from_u32);
    }
    if let Some(i) = attr(e, b"indexed").and_then(|v| v.parse::<usize>().ok()) {
        return INDEXED.get(i).copied().map(Color::from_u32);
    }
    attr(e, b"theme")
        .and_then(|v| v.parse::<usize>().ok())
        .and_then(|i| THEME.get(i).copied())
        .map(Color::from_u32)
}

fn underline(e: &BytesStart) -> Underline {
    match attr(e, b"val").as_deref() {
        Some("double") | Some("doubleAccounting") => Underline::Double,
        Some("none") => Underline::None,
        _ => Underline::Single,
    }
}

/// `<b/>` and `<b val="1"/>` are on; `<b val="0"/>` is off
fn flag(e: &BytesStart) -> bool {
    !matches!(attr(e, b"val").as_deref(), Some("0") | Some("false"))
}

/// Unescaped value of the attribute with local name `key`
pub(crate) fn attr(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| unescape(&String::from_utf8_lossy(&a.value)).ok().map(|v| v.into_owned()))
}
