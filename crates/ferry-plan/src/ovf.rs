//! Firmware detection in the configuration emitted by the conversion pod
//!
//! The converted guest is described either as a libvirt domain (`<os>` with
//! a `firmware` attribute or a `<loader>` element) or as an OVF whose
//! `BiosType` selects the chipset/firmware combination.

use quick_xml::events::Event;
use quick_xml::Reader;

use ferry_common::{Error, Result};

/// UEFI firmware
pub const FIRMWARE_EFI: &str = "efi";
/// Legacy BIOS firmware
pub const FIRMWARE_BIOS: &str = "bios";

/// OVF `BiosType` values selecting OVMF (plain and secure boot)
const OVF_EFI_BIOS_TYPES: &[&str] = &["3", "4"];

/// Detect the firmware (`"efi"` or `"bios"`) of a converted guest
pub fn firmware_from_config(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut in_bios_type = false;
    let mut saw_root = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::serialization("ConvertedConfig", e.to_string()))?;
        match event {
            Event::Start(e) | Event::Empty(e) => {
                saw_root = true;
                let name = e.local_name();
                match name.as_ref() {
                    b"os" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.local_name().as_ref() == b"firmware"
                                && attr.value.as_ref() == FIRMWARE_EFI.as_bytes()
                            {
                                return Ok(FIRMWARE_EFI.to_string());
                            }
                        }
                    }
                    b"loader" => return Ok(FIRMWARE_EFI.to_string()),
                    b"BiosType" => in_bios_type = true,
                    _ => {}
                }
            }
            Event::Text(t) if in_bios_type => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::serialization("ConvertedConfig", e.to_string()))?;
                if OVF_EFI_BIOS_TYPES.contains(&text.trim()) {
                    return Ok(FIRMWARE_EFI.to_string());
                }
                in_bios_type = false;
            }
            Event::End(_) => in_bios_type = false,
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(Error::serialization("ConvertedConfig", "empty document"));
    }
    Ok(FIRMWARE_BIOS.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const DOMAIN_EFI: &str = r#"<domain type="kvm">
  <name>web</name>
  <os>
    <type arch="x86_64" machine="q35">hvm</type>
    <loader readonly="yes" type="pflash">/usr/share/OVMF/OVMF_CODE.fd</loader>
  </os>
</domain>"#;

    const DOMAIN_FIRMWARE_ATTR: &str = r#"<domain type="kvm"><os firmware="efi"><type>hvm</type></os></domain>"#;

    const DOMAIN_BIOS: &str = r#"<domain type="kvm"><os><type>hvm</type><boot dev="hd"/></os></domain>"#;

    const OVF_EFI: &str = r#"<ovf:Envelope xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1/">
  <Content ovf:id="out">
    <BiosType>4</BiosType>
  </Content>
</ovf:Envelope>"#;

    const OVF_BIOS: &str = r#"<ovf:Envelope xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1/">
  <Content><BiosType>2</BiosType></Content>
</ovf:Envelope>"#;

    #[rstest]
    #[case(DOMAIN_EFI, FIRMWARE_EFI)]
    #[case(DOMAIN_FIRMWARE_ATTR, FIRMWARE_EFI)]
    #[case(DOMAIN_BIOS, FIRMWARE_BIOS)]
    #[case(OVF_EFI, FIRMWARE_EFI)]
    #[case(OVF_BIOS, FIRMWARE_BIOS)]
    fn test_firmware_is_detected(#[case] xml: &str, #[case] expected: &str) {
        assert_eq!(firmware_from_config(xml).unwrap(), expected);
    }

    #[test]
    fn test_garbage_is_a_serialization_error() {
        assert!(matches!(
            firmware_from_config(""),
            Err(Error::Serialization { .. })
        ));
        assert!(firmware_from_config("<domain><os></domain>").is_err());
    }
}
