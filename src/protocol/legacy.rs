//! Old style fixed-width TESS payload.
//!
//! ```text
//! <fH 04606><tA +2987><tO +2481><mZ -0000>
//! 0         10        20        30       39
//! ```
//!
//! `fH` carries the frequency in Hz, `fm` in mHz. `tA` (box temperature), `tO` (sky
//! temperature) and `mZ` (zero point) are signed hundredths. Fields are read by byte
//! position; anything that does not fit the layout exactly is rejected.

use super::Fields;

/// Length of a complete record, without line terminators.
pub const RECORD_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FreqUnit {
    Hz,
    MilliHz,
}

/// Decodes one fixed-width record. Trailing bytes after the record are ignored.
pub(crate) fn parse(frame: &[u8]) -> Option<Fields> {
    let line = frame.trim_ascii();
    if line.len() < RECORD_LEN {
        return None;
    }

    let unit = match &line[0..3] {
        b"<fH" => FreqUnit::Hz,
        b"<fm" => FreqUnit::MilliHz,
        _ => return None,
    };
    let literals: [(usize, &[u8]); 4] = [
        (9, b"><tA "),
        (19, b"><tO "),
        (29, b"><mZ "),
        (39, b">"),
    ];
    if literals
        .iter()
        .any(|(pos, lit)| &line[*pos..*pos + lit.len()] != *lit)
    {
        return None;
    }

    // frequency sign slot holds a blank or '+', never '-'
    if !matches!(line[3], b' ' | b'+') {
        return None;
    }
    let raw_freq = digits(&line[4..9])?;
    let tbox = signed_hundredths(&line[14..19])?;
    let tsky = signed_hundredths(&line[24..29])?;
    let zp = signed_hundredths(&line[34..39])?;

    let freq = match unit {
        FreqUnit::Hz => raw_freq as f64,
        FreqUnit::MilliHz => raw_freq as f64 / 1000.0,
    };

    Some(Fields {
        freq,
        tbox: Some(tbox),
        tsky: Some(tsky),
        zp: Some(zp),
        seq: None,
    })
}

fn digits(field: &[u8]) -> Option<u32> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return None;
    }
    Some(
        field
            .iter()
            .fold(0u32, |acc, d| acc * 10 + u32::from(d - b'0')),
    )
}

// `±NNNN` scaled by 1/100
fn signed_hundredths(field: &[u8]) -> Option<f64> {
    let sign = match field.first()? {
        b'+' => 1.0,
        b'-' => -1.0,
        _ => return None,
    };
    let magnitude = digits(&field[1..])?;
    Some(sign * magnitude as f64 / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hz_record() {
        let fields = parse(b"<fH 04606><tA +2987><tO +2481><mZ -0000>").unwrap();
        assert_eq!(fields.freq, 4606.0);
        assert_eq!(fields.tbox, Some(29.87));
        assert_eq!(fields.tsky, Some(24.81));
        assert_eq!(fields.zp, Some(0.0));
        assert_eq!(fields.seq, None);
    }

    #[test]
    fn decodes_millihz_record() {
        let fields = parse(b"<fm+12345><tA -0150><tO -1020><mZ +2044>\r\n").unwrap();
        assert!((fields.freq - 12.345).abs() < 1e-12);
        assert_eq!(fields.tbox, Some(-1.5));
        assert_eq!(fields.tsky, Some(-10.2));
        assert_eq!(fields.zp, Some(20.44));
    }

    #[test]
    fn rejects_malformed_records() {
        // truncated
        assert!(parse(b"<fH 04606><tA +2987><tO +2481>").is_none());
        // unknown frequency tag
        assert!(parse(b"<fX 04606><tA +2987><tO +2481><mZ -0000>").is_none());
        // negative frequency
        assert!(parse(b"<fH-04606><tA +2987><tO +2481><mZ -0000>").is_none());
        // unsigned temperature
        assert!(parse(b"<fH 04606><tA  2987><tO +2481><mZ -0000>").is_none());
        // non digit
        assert!(parse(b"<fH 04a06><tA +2987><tO +2481><mZ -0000>").is_none());
        // field widths shifted
        assert!(parse(b"<fH 4606><tA +2987><tO +2481><mZ -0000>>").is_none());
        assert!(parse(b"{\"freq\": 4606}").is_none());
    }
}
