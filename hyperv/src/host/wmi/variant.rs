//! VARIANT decoding for WMI property values.
//!
//! The WMI provider widens CIM integer types when marshalling: `uint16` and
//! `uint32` arrive as `VT_I4`, and `uint64` arrives as a decimal `VT_BSTR`.

use windows::core::BSTR;
use windows::Win32::System::Ole::{SafeArrayGetElement, SafeArrayGetLBound, SafeArrayGetUBound};
use windows::Win32::System::Variant::{
    VARIANT, VARENUM, VT_ARRAY, VT_BOOL, VT_BSTR, VT_EMPTY, VT_I2, VT_I4, VT_I8, VT_NULL,
    VT_UI1, VT_UI2, VT_UI4, VT_UI8,
};

use crate::error::{Error, Result};

/// Decode a Rust value from a WMI VARIANT.
pub trait FromVariant: Sized {
    /// `Ok(None)` for `VT_NULL` and `VT_EMPTY`.
    ///
    /// # Safety
    ///
    /// `value` must be a VARIANT initialized by WMI whose union member
    /// matches its `vt` tag.
    unsafe fn from_variant(value: &VARIANT, property: &str) -> Result<Option<Self>>;
}

fn mismatch(property: &str, expected: &'static str) -> Error {
    Error::TypeConversion {
        property: property.to_string(),
        expected,
    }
}

unsafe fn variant_type(value: &VARIANT) -> VARENUM {
    value.Anonymous.Anonymous.vt
}

unsafe fn is_null(value: &VARIANT) -> bool {
    let vt = variant_type(value);
    vt == VT_NULL || vt == VT_EMPTY
}

/// Widen any integer-like VARIANT to i128 so callers can range-check.
unsafe fn integer(value: &VARIANT, property: &str, expected: &'static str) -> Result<i128> {
    let inner = &value.Anonymous.Anonymous.Anonymous;
    let vt = variant_type(value);
    let wide = if vt == VT_I4 {
        inner.lVal as i128
    } else if vt == VT_UI4 {
        inner.ulVal as i128
    } else if vt == VT_I2 {
        inner.iVal as i128
    } else if vt == VT_UI2 {
        inner.uiVal as i128
    } else if vt == VT_UI1 {
        inner.bVal as i128
    } else if vt == VT_I8 {
        inner.llVal as i128
    } else if vt == VT_UI8 {
        inner.ullVal as i128
    } else if vt == VT_BSTR {
        let text = String::try_from(&*inner.bstrVal).map_err(|_| mismatch(property, expected))?;
        text.trim()
            .parse::<i128>()
            .map_err(|_| mismatch(property, expected))?
    } else {
        return Err(mismatch(property, expected));
    };
    Ok(wide)
}

impl FromVariant for u16 {
    unsafe fn from_variant(value: &VARIANT, property: &str) -> Result<Option<Self>> {
        if is_null(value) {
            return Ok(None);
        }
        // VT_I2 carries uint16 values above i16::MAX as negatives.
        if variant_type(value) == VT_I2 {
            return Ok(Some(value.Anonymous.Anonymous.Anonymous.iVal as u16));
        }
        let wide = integer(value, property, "u16")?;
        u16::try_from(wide)
            .map(Some)
            .map_err(|_| mismatch(property, "u16"))
    }
}

impl FromVariant for u32 {
    unsafe fn from_variant(value: &VARIANT, property: &str) -> Result<Option<Self>> {
        if is_null(value) {
            return Ok(None);
        }
        // VT_I4 carries uint32 values above i32::MAX as negatives.
        if variant_type(value) == VT_I4 {
            return Ok(Some(value.Anonymous.Anonymous.Anonymous.lVal as u32));
        }
        let wide = integer(value, property, "u32")?;
        u32::try_from(wide)
            .map(Some)
            .map_err(|_| mismatch(property, "u32"))
    }
}

impl FromVariant for u64 {
    unsafe fn from_variant(value: &VARIANT, property: &str) -> Result<Option<Self>> {
        if is_null(value) {
            return Ok(None);
        }
        let wide = integer(value, property, "u64")?;
        u64::try_from(wide)
            .map(Some)
            .map_err(|_| mismatch(property, "u64"))
    }
}

impl FromVariant for bool {
    unsafe fn from_variant(value: &VARIANT, property: &str) -> Result<Option<Self>> {
        if is_null(value) {
            return Ok(None);
        }
        if variant_type(value) != VT_BOOL {
            return Err(mismatch(property, "bool"));
        }
        Ok(Some(value.Anonymous.Anonymous.Anonymous.boolVal.as_bool()))
    }
}

impl FromVariant for String {
    unsafe fn from_variant(value: &VARIANT, property: &str) -> Result<Option<Self>> {
        if is_null(value) {
            return Ok(None);
        }
        if variant_type(value) != VT_BSTR {
            return Err(mismatch(property, "String"));
        }
        String::try_from(&*value.Anonymous.Anonymous.Anonymous.bstrVal)
            .map(Some)
            .map_err(|_| mismatch(property, "String"))
    }
}

impl FromVariant for Vec<String> {
    unsafe fn from_variant(value: &VARIANT, property: &str) -> Result<Option<Self>> {
        if is_null(value) {
            return Ok(None);
        }
        if variant_type(value) != VT_ARRAY | VT_BSTR {
            return Err(mismatch(property, "String[]"));
        }
        let sa = value.Anonymous.Anonymous.Anonymous.parray;
        if sa.is_null() {
            return Ok(Some(Vec::new()));
        }

        let safe_array_error = |method: &str, e: windows::core::Error| Error::WmiMethod {
            class: "SafeArray".to_string(),
            method: method.to_string(),
            hresult: e.code().0 as u32,
            message: e.message().to_string(),
        };
        let lower = SafeArrayGetLBound(sa, 1).map_err(|e| safe_array_error("GetLBound", e))?;
        let upper = SafeArrayGetUBound(sa, 1).map_err(|e| safe_array_error("GetUBound", e))?;

        let mut items = Vec::with_capacity((upper - lower + 1).max(0) as usize);
        for index in lower..=upper {
            // GetElement hands back a copy that BSTR frees on drop.
            let mut element = BSTR::new();
            SafeArrayGetElement(sa, &index, &mut element as *mut BSTR as *mut _)
                .map_err(|e| safe_array_error("GetElement", e))?;
            items.push(String::try_from(&element).map_err(|_| mismatch(property, "String[]"))?);
        }
        Ok(Some(items))
    }
}
