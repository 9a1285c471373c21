/// 80x25 colour text mode helpers
///
/// Video memory holds one character byte and one attribute byte per cell.

/// Linear address of the colour text buffer
pub const TEXT_BASE: u32 = 0xB8000;
pub const COLUMNS: usize = 80;
pub const ROWS: usize = 25;
/// One full page, character and attribute bytes
pub const SCREEN_BYTES: usize = COLUMNS * ROWS * 2;
/// BIOS data area timer tick counter, incremented about 18.2 times a second
pub const BDA_TIMER_TICKS: u32 = 0x46C;

/// Standard VGA text palette, indexed by colour number
pub const PALETTE: [&str; 16] = [
    "#000000", "#0000aa", "#00aa00", "#00aaaa", "#aa0000", "#aa00aa", "#aa5500", "#aaaaaa",
    "#555555", "#5555ff", "#55ff55", "#55ffff", "#ff5555", "#ff55ff", "#ffff55", "#ffffff",
];

const HTML_HEAD: &str = "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
<title>DOS screen</title>\n<style>\n\
body { background: #000000; }\n\
pre { font-family: monospace; line-height: 1.0; margin: 0; }\n\
.blink { animation: blink 1s step-end infinite; }\n\
@keyframes blink { 50% { color: transparent; } }\n\
</style>\n</head>\n<body>\n<pre>";
const HTML_TAIL: &str = "</pre>\n</body>\n</html>\n";

/// Decoded attribute byte: low nibble foreground, bits 4-6 background, bit 7 blink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute {
    pub foreground: u8,
    pub background: u8,
    pub blink: bool,
}

impl From<u8> for Attribute {
    fn from(byte: u8) -> Self {
        Self {
            foreground: byte & 0x0f,
            background: (byte >> 4) & 0x07,
            blink: byte & 0x80 != 0,
        }
    }
}

impl Attribute {
    fn open_tag(&self) -> String {
        let class = if self.blink { " class=\"blink\"" } else { "" };
        format!(
            "<span{} style=\"color:{};background:{}\">",
            class,
            PALETTE[self.foreground as usize],
            PALETTE[self.background as usize]
        )
    }
}

/// Printable ASCII as-is, everything else as `.`
pub fn display_char(byte: u8) -> char {
    if (0x20..=0x7e).contains(&byte) {
        byte as char
    } else {
        '.'
    }
}

/// Characters of each row with trailing blanks trimmed, attributes dropped
pub fn text_lines(data: &[u8]) -> Vec<String> {
    data.chunks(COLUMNS * 2)
        .take(ROWS)
        .map(|row| {
            let line: String = row.iter().step_by(2).map(|&b| display_char(b)).collect();
            line.trim_end().to_string()
        })
        .collect()
}

fn push_escaped(out: &mut String, c: char) {
    match c {
        '<' => out.push_str("&lt;"),
        '>' => out.push_str("&gt;"),
        '&' => out.push_str("&amp;"),
        '"' => out.push_str("&quot;"),
        _ => out.push(c),
    }
}

/// One row as coloured spans, adjacent cells with the same attribute merged
pub fn html_row(row: &[u8]) -> String {
    let mut out = String::new();
    let mut current: Option<Attribute> = None;

    for cell in row.chunks_exact(2) {
        let attribute = Attribute::from(cell[1]);
        if current != Some(attribute) {
            if current.is_some() {
                out.push_str("</span>");
            }
            out.push_str(&attribute.open_tag());
            current = Some(attribute);
        }
        let c = if cell[0] == 0 { ' ' } else { display_char(cell[0]) };
        push_escaped(&mut out, c);
    }

    if current.is_some() {
        out.push_str("</span>");
    }
    out
}

/// Standalone HTML page reproducing the screen with its colours
pub fn to_html(data: &[u8]) -> String {
    let rows: Vec<String> = data.chunks(COLUMNS * 2).take(ROWS).map(html_row).collect();
    format!("{}{}{}", HTML_HEAD, rows.join("\n"), HTML_TAIL)
}

/// Little-endian tick counter read from `BDA_TIMER_TICKS`
pub fn tick_count(data: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}
