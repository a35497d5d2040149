use anyhow::anyhow;
use zon_alb_common::{MacAddr, MAC_BCAST, MAC_ZERO};

pub fn ifindex(ifname: &str) -> Result<u32, anyhow::Error> {
    if ifname.starts_with("if#") && ifname.len() > 3 {
        if let Ok(index) = ifname[3..].parse::<u32>() {
            return Ok(index);
        }
    }

    let c_interface = std::ffi::CString::new(ifname)?;
    let if_index = unsafe { libc::if_nametoindex(c_interface.as_ptr()) };
    if if_index == 0 {
        Err(anyhow!("No interface named {}", ifname))
    } else {
        Ok(if_index)
    }
}

pub fn mac_to_str(mac: &MacAddr) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

pub fn parse_mac<T: AsRef<str>>(input: T) -> Result<MacAddr, anyhow::Error> {
    let input = input.as_ref().trim();
    let mut mac = [0; 6];

    for sep in [':', '-'] {
        let bytes: Vec<&str> = input.split(sep).collect();
        if bytes.len() == 6 {
            for (i, b) in bytes.iter().enumerate() {
                mac[i] = u8::from_str_radix(b, 16)
                    .map_err(|e| anyhow!("invalid mac address '{}', {}", input, e))?;
            }
            return Ok(mac);
        }
    }

    if input.len() != 12 {
        return Err(anyhow!("invalid length for mac address '{}'", input));
    }

    for (i, c) in input.char_indices() {
        let hexd = c.to_digit(16).ok_or(anyhow!("non hex digit '{}'", c))? as u8;
        mac[i / 2] |= hexd << 4 * (1 - (i & 1));
    }

    Ok(mac)
}

pub fn is_unicast_mac(mac: &MacAddr) -> bool {
    *mac != MAC_ZERO && (mac[0] & 0x1) == 0_u8
}

pub fn is_broadcast_mac(mac: &MacAddr) -> bool {
    *mac == MAC_BCAST
}

pub fn parse_unicast_mac<T: AsRef<str>>(input: T) -> Result<MacAddr, anyhow::Error> {
    let mac = parse_mac(input)?;
    if is_unicast_mac(&mac) {
        return Ok(mac);
    }

    Err(anyhow!("Not a unicast address, {}", mac_to_str(&mac)))
}

fn cstr_to_string(cstr_buff: *const libc::c_char) -> String {
    let str = unsafe { std::ffi::CStr::from_ptr(cstr_buff) };
    let str = str.to_string_lossy();
    str.to_string()
}

pub fn str_error(err: i32) -> String {
    let mut buff = [0 as libc::c_char; 256];
    let rc = unsafe { libc::strerror_r(err, buff.as_mut_ptr(), buff.len()) };

    if rc != 0 {
        format!("errno={}, unknown", err)
    } else {
        cstr_to_string(buff.as_ptr())
    }
}

pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

pub fn str_errno() -> String {
    str_error(errno())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mac_accepts_common_notations() {
        let expected = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:ff").unwrap(), expected);
        assert_eq!(parse_mac("AA-BB-CC-DD-EE-FF").unwrap(), expected);
        assert_eq!(parse_mac("aabbccddeeff").unwrap(), expected);
        assert!(parse_mac("aa:bb:cc").is_err());
        assert!(parse_mac("aabbccddeeffaa").is_err());
        assert!(parse_mac("zz:bb:cc:dd:ee:ff").is_err());
    }

    #[test]
    fn unicast_rules() {
        assert!(is_unicast_mac(&[0x02, 0, 0, 0, 0, 1]));
        assert!(!is_unicast_mac(&MAC_ZERO));
        assert!(!is_unicast_mac(&MAC_BCAST));
        assert!(!is_unicast_mac(&[0x33, 0x33, 0, 0, 0, 1]));
        assert!(parse_unicast_mac("01:00:5e:00:00:01").is_err());
    }

    #[test]
    fn mac_formatting() {
        assert_eq!(mac_to_str(&[0x02, 0, 0, 0, 0xa, 0xff]), "02:00:00:00:0a:ff");
    }

    #[test]
    fn ifindex_accepts_index_notation() {
        assert_eq!(ifindex("if#7").unwrap(), 7);
    }
}
