//! Stateful filter that removes terminal query-response sequences from a
//! session's output stream before it reaches history or scrollback.
//!
//! When a headless session is viewed through a frontend emulator, the
//! emulator answers queries (cursor position, device attributes, colors)
//! by writing the response into the pty. The shell echoes those responses
//! into the output stream, and replaying them later corrupts the next
//! viewer's terminal. This filter strips exactly those response shapes and
//! passes everything else through byte-for-byte, in order.
//!
//! Removed:
//! - cursor position reports            `ESC [ Pl ; Pc R` / `ESC [ ? ... R`
//! - primary device attributes          `ESC [ ? ... c`
//! - secondary device attributes        `ESC [ > ... c`
//! - tertiary device attributes (DCS)   `ESC P ! | ... ESC \`
//! - DEC private mode reports           `ESC [ ? Pm ; Ps $ y`
//! - ANSI mode reports                  `ESC [ Pm ; Ps $ y`
//! - OSC color query responses          `ESC ] 4|10|11|12 ; ... rgb: ... (BEL | ESC \)`
//! - terminal-OK status report          `ESC [ 0 n`
//!
//! Single pass, no backtracking, no regex: this runs on every byte of
//! every session's output. A sequence split across chunks is buffered
//! until its terminator arrives; a byte that disproves the match flushes
//! the buffer verbatim.

/// Incomplete sequences longer than this are given up on and emitted
/// verbatim, so a stream that opens an OSC and never terminates it cannot
/// buffer unboundedly.
const MAX_PENDING: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Ground,
    Escape,
    Csi,
    Osc,
    OscEscape,
    Dcs,
    DcsEscape,
}

pub struct EscapeFilter {
    state: State,
    pending: Vec<u8>,
}

impl EscapeFilter {
    pub fn new() -> Self {
        Self {
            state: State::Ground,
            pending: Vec::new(),
        }
    }

    /// Filter one chunk. Chunk boundaries are arbitrary; concatenated
    /// outputs across any split equal filtering the unsplit input.
    pub fn filter(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len());
        for &b in chunk {
            self.step(b, &mut out);
        }
        out
    }

    /// Return whatever sequence is left incomplete, verbatim. Called at
    /// session end so no bytes are ever silently dropped.
    pub fn flush(&mut self) -> Vec<u8> {
        self.state = State::Ground;
        std::mem::take(&mut self.pending)
    }

    pub fn reset(&mut self) {
        self.state = State::Ground;
        self.pending.clear();
    }

    fn step(&mut self, b: u8, out: &mut Vec<u8>) {
        if self.state != State::Ground && self.pending.len() >= MAX_PENDING {
            // Never-terminating sequence; stop buffering.
            self.emit_pending(out);
            self.state = State::Ground;
        }

        match self.state {
            State::Ground => {
                if b == 0x1b {
                    self.pending.push(b);
                    self.state = State::Escape;
                } else {
                    out.push(b);
                }
            }
            State::Escape => match b {
                b'[' => {
                    self.pending.push(b);
                    self.state = State::Csi;
                }
                b']' => {
                    self.pending.push(b);
                    self.state = State::Osc;
                }
                b'P' => {
                    self.pending.push(b);
                    self.state = State::Dcs;
                }
                0x1b => {
                    // Bare ESC followed by another ESC: the first one was
                    // not a sequence we track.
                    self.emit_pending(out);
                    self.pending.push(b);
                }
                _ => {
                    // Two-byte escape (RI, IND, charset, ...): not ours.
                    self.pending.push(b);
                    self.emit_pending(out);
                    self.state = State::Ground;
                }
            },
            State::Csi => {
                if (0x20..=0x3f).contains(&b) {
                    self.pending.push(b);
                } else if (0x40..=0x7e).contains(&b) {
                    self.pending.push(b);
                    self.finish_csi(out);
                    self.state = State::Ground;
                } else if b == 0x1b {
                    // Sequence aborted by a new escape.
                    self.emit_pending(out);
                    self.pending.push(b);
                    self.state = State::Escape;
                } else {
                    self.pending.push(b);
                    self.emit_pending(out);
                    self.state = State::Ground;
                }
            }
            State::Osc => {
                if b == 0x07 {
                    self.pending.push(b);
                    self.finish_osc(1, out);
                    self.state = State::Ground;
                } else if b == 0x1b {
                    self.pending.push(b);
                    self.state = State::OscEscape;
                } else {
                    self.pending.push(b);
                }
            }
            State::OscEscape => {
                if b == b'\\' {
                    self.pending.push(b);
                    self.finish_osc(2, out);
                } else {
                    // ESC inside the OSC body that wasn't ST.
                    self.pending.push(b);
                    self.emit_pending(out);
                }
                self.state = State::Ground;
            }
            State::Dcs => {
                if b == 0x1b {
                    self.pending.push(b);
                    self.state = State::DcsEscape;
                } else {
                    self.pending.push(b);
                }
            }
            State::DcsEscape => {
                if b == b'\\' {
                    self.pending.push(b);
                    self.finish_dcs(out);
                } else {
                    self.pending.push(b);
                    self.emit_pending(out);
                }
                self.state = State::Ground;
            }
        }
    }

    fn emit_pending(&mut self, out: &mut Vec<u8>) {
        out.append(&mut self.pending);
    }

    /// Completed CSI in `pending` as `ESC [ <params+intermediates> <final>`.
    fn finish_csi(&mut self, out: &mut Vec<u8>) {
        let len = self.pending.len();
        let params = &self.pending[2..len - 1];
        let final_byte = self.pending[len - 1];
        if csi_is_response(params, final_byte) {
            self.pending.clear();
        } else {
            self.emit_pending(out);
        }
    }

    /// Completed OSC in `pending` as `ESC ] <payload> <terminator>`;
    /// `term_len` is 1 for BEL, 2 for ESC backslash.
    fn finish_osc(&mut self, term_len: usize, out: &mut Vec<u8>) {
        let payload = &self.pending[2..self.pending.len() - term_len];
        if osc_is_color_response(payload) {
            self.pending.clear();
        } else {
            self.emit_pending(out);
        }
    }

    /// Completed DCS in `pending` as `ESC P <payload> ESC \`.
    fn finish_dcs(&mut self, out: &mut Vec<u8>) {
        let payload = &self.pending[2..self.pending.len() - 2];
        // `!|` introduces a tertiary device attributes report.
        if payload.starts_with(b"!|") {
            self.pending.clear();
        } else {
            self.emit_pending(out);
        }
    }
}

impl Default for EscapeFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn csi_is_response(params: &[u8], final_byte: u8) -> bool {
    match final_byte {
        // Cursor position report: `Pl;Pc R`, DECXCPR adds a leading `?`.
        b'R' => {
            let body = params.strip_prefix(b"?").unwrap_or(params);
            !body.is_empty()
                && body.contains(&b';')
                && body.iter().all(|&c| c.is_ascii_digit() || c == b';')
        }
        // Device attribute reports are distinguished by their prefix; the
        // corresponding queries (`ESC[c`, `ESC[0c`) have none and pass.
        b'c' => {
            matches!(params.first(), Some(b'?' | b'>' | b'='))
                && params[1..]
                    .iter()
                    .all(|&c| c.is_ascii_digit() || c == b';')
        }
        // Mode reports: `Pm;Ps $ y`, DEC private variant has a leading `?`.
        b'y' => {
            let body = params.strip_prefix(b"?").unwrap_or(params);
            match body.strip_suffix(b"$") {
                Some(nums) => {
                    !nums.is_empty()
                        && nums.contains(&b';')
                        && nums.iter().all(|&c| c.is_ascii_digit() || c == b';')
                }
                None => false,
            }
        }
        // `ESC[0n`: "terminal OK" status report some emulators emit
        // unprompted. `ESC[5n`/`ESC[6n` are queries and pass through.
        b'n' => params == b"0",
        _ => false,
    }
}

fn osc_is_color_response(payload: &[u8]) -> bool {
    let is_color_code = payload.starts_with(b"4;")
        || payload.starts_with(b"10;")
        || payload.starts_with(b"11;")
        || payload.starts_with(b"12;");
    is_color_code && contains(payload, b"rgb:")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &[u8]) -> Vec<u8> {
        let mut f = EscapeFilter::new();
        let mut out = f.filter(input);
        out.extend(f.flush());
        out
    }

    // ── Removal of each recognized response shape ───────────────────

    #[test]
    fn removes_cursor_position_report() {
        assert_eq!(run(b"before\x1b[24;80Rafter"), b"beforeafter");
    }

    #[test]
    fn removes_extended_cursor_position_report() {
        // DECXCPR includes a page number and a `?` prefix.
        assert_eq!(run(b"a\x1b[?24;80;1Rb"), b"ab");
    }

    #[test]
    fn removes_primary_device_attributes() {
        assert_eq!(run(b"x\x1b[?1;2cy"), b"xy");
        assert_eq!(run(b"x\x1b[?62;22cy"), b"xy");
    }

    #[test]
    fn removes_secondary_device_attributes() {
        assert_eq!(run(b"x\x1b[>0;276;0cy"), b"xy");
    }

    #[test]
    fn removes_tertiary_device_attributes_dcs() {
        assert_eq!(run(b"x\x1bP!|00000000\x1b\\y"), b"xy");
    }

    #[test]
    fn removes_dec_mode_report() {
        assert_eq!(run(b"x\x1b[?2026;2$yz"), b"xz");
    }

    #[test]
    fn removes_ansi_mode_report() {
        assert_eq!(run(b"x\x1b[4;1$yz"), b"xz");
    }

    #[test]
    fn removes_osc_color_responses() {
        assert_eq!(run(b"x\x1b]10;rgb:ffff/ffff/ffff\x07y"), b"xy");
        assert_eq!(run(b"x\x1b]11;rgb:0000/0000/0000\x1b\\y"), b"xy");
        assert_eq!(run(b"x\x1b]12;rgb:1234/5678/9abc\x07y"), b"xy");
        // Palette entry report carries an index before the color.
        assert_eq!(run(b"x\x1b]4;1;rgb:aaaa/bbbb/cccc\x07y"), b"xy");
    }

    #[test]
    fn removes_terminal_ok_status_report() {
        assert_eq!(run(b"x\x1b[0ny"), b"xy");
    }

    #[test]
    fn removes_adjacent_responses() {
        assert_eq!(run(b"s\x1b[24;80R\x1b[?1;2c\x1b[?2026;2$ye"), b"se");
    }

    // ── Passthrough ─────────────────────────────────────────────────

    #[test]
    fn passes_sgr_sequences() {
        let input = b"\x1b[1mbold\x1b[0m \x1b[38;5;196mred\x1b[m";
        assert_eq!(run(input), input.to_vec());
    }

    #[test]
    fn passes_cursor_movement() {
        let input = b"\x1b[H\x1b[2J\x1b[10;20H";
        assert_eq!(run(input), input.to_vec());
    }

    #[test]
    fn passes_device_attribute_queries() {
        // Queries lack the response prefix and must survive.
        for input in [&b"\x1b[c"[..], b"\x1b[0c", b"\x1b[6n", b"\x1b[5n"] {
            assert_eq!(run(input), input.to_vec(), "input {:?}", input);
        }
    }

    #[test]
    fn passes_osc_title_and_cwd() {
        let input = b"\x1b]0;my title\x07\x1b]7;file:///tmp\x07";
        assert_eq!(run(input), input.to_vec());
    }

    #[test]
    fn passes_osc_color_query() {
        // A query payload is `10;?`, not an rgb value.
        let input = b"\x1b]10;?\x07";
        assert_eq!(run(input), input.to_vec());
    }

    #[test]
    fn passes_non_report_dcs() {
        let input = b"\x1bPqsixel-ish\x1b\\";
        assert_eq!(run(input), input.to_vec());
    }

    #[test]
    fn passes_two_byte_escapes() {
        let input = b"a\x1bMb\x1b7c\x1b8d";
        assert_eq!(run(input), input.to_vec());
    }

    #[test]
    fn plain_text_untouched() {
        let input = b"plain text, no escapes at all\n";
        assert_eq!(run(input), input.to_vec());
    }

    #[test]
    fn preserves_order_around_removals() {
        assert_eq!(
            run(b"\x1b[1mA\x1b[24;80RB\x1b[0m"),
            b"\x1b[1mAB\x1b[0m".to_vec()
        );
    }

    // ── Chunk-boundary invariance ───────────────────────────────────

    #[test]
    fn split_anywhere_equals_single_pass() {
        let input: &[u8] = b"pre\x1b[12;40Rmid\x1b[1;31mcolor\x1b]11;rgb:1111/2222/3333\x1b\\\
            \x1b[>0;10;1ctail\x1bP!|7e543210\x1b\\done\x1b[?1049h";
        let expect = run(input);
        for split in 1..input.len() {
            let mut f = EscapeFilter::new();
            let mut out = f.filter(&input[..split]);
            out.extend(f.filter(&input[split..]));
            out.extend(f.flush());
            assert_eq!(out, expect, "split at {}", split);
        }
    }

    #[test]
    fn byte_at_a_time_equals_single_pass() {
        let input: &[u8] = b"\x1b[6n\x1b[24;80R\x1b[38;5;2mgreen\x1b[0m\x1b]0;t\x07";
        let expect = run(input);
        let mut f = EscapeFilter::new();
        let mut out = Vec::new();
        for &b in input {
            out.extend(f.filter(&[b]));
        }
        out.extend(f.flush());
        assert_eq!(out, expect);
    }

    // ── Incomplete / malformed input ────────────────────────────────

    #[test]
    fn flush_returns_incomplete_csi() {
        let mut f = EscapeFilter::new();
        assert_eq!(f.filter(b"text\x1b[12;4"), b"text");
        assert_eq!(f.flush(), b"\x1b[12;4");
    }

    #[test]
    fn flush_returns_bare_escape() {
        let mut f = EscapeFilter::new();
        assert_eq!(f.filter(b"text\x1b"), b"text");
        assert_eq!(f.flush(), b"\x1b");
    }

    #[test]
    fn flush_returns_unterminated_osc() {
        let mut f = EscapeFilter::new();
        assert_eq!(f.filter(b"x\x1b]10;rgb:ffff/ffff/ffff"), b"x");
        assert_eq!(f.flush(), b"\x1b]10;rgb:ffff/ffff/ffff");
    }

    #[test]
    fn flush_twice_is_empty() {
        let mut f = EscapeFilter::new();
        f.filter(b"\x1b[1");
        assert!(!f.flush().is_empty());
        assert!(f.flush().is_empty());
    }

    #[test]
    fn reset_discards_pending() {
        let mut f = EscapeFilter::new();
        f.filter(b"\x1b[12");
        f.reset();
        assert_eq!(f.filter(b"ok"), b"ok");
        assert!(f.flush().is_empty());
    }

    #[test]
    fn control_byte_aborts_csi_verbatim() {
        // A CR inside a CSI disproves the match; everything is emitted.
        assert_eq!(run(b"\x1b[12\rx"), b"\x1b[12\rx");
    }

    #[test]
    fn escape_inside_csi_starts_new_sequence() {
        // The aborted prefix comes out verbatim, the new CPR is removed.
        assert_eq!(run(b"\x1b[12\x1b[24;80Rx"), b"\x1b[12x");
    }

    #[test]
    fn overlong_osc_is_released() {
        let mut input = b"\x1b]0;".to_vec();
        input.extend(std::iter::repeat(b'a').take(MAX_PENDING + 100));
        let out = run(&input);
        assert_eq!(out, input);
    }

    #[test]
    fn empty_input() {
        assert!(run(b"").is_empty());
    }
}
