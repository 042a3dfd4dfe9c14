use std::cell::Cell;
use std::time::Duration;

use windows::core::{BSTR, HSTRING, PCWSTR};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoInitializeSecurity, CoSetProxyBlanket,
    CLSCTX_INPROC_SERVER, COINIT_MULTITHREADED, EOAC_NONE, RPC_C_AUTHN_LEVEL_CALL,
    RPC_C_AUTHN_LEVEL_DEFAULT, RPC_C_IMP_LEVEL_IMPERSONATE,
};
use windows::Win32::System::Rpc::{RPC_C_AUTHN_WINNT, RPC_C_AUTHZ_NONE};
use windows::Win32::System::Variant::VARIANT;
use windows::Win32::System::Wmi::{
    IEnumWbemClassObject, IWbemClassObject, IWbemLocator, IWbemServices, WbemLocator,
    WBEM_FLAG_CONNECT_USE_MAX_WAIT, WBEM_FLAG_FORWARD_ONLY, WBEM_FLAG_RETURN_IMMEDIATELY,
    WBEM_INFINITE,
};

use super::variant::FromVariant;
use crate::error::{Error, FailureType, Result};

thread_local! {
    static COM_INITIALIZED: Cell<bool> = const { Cell::new(false) };
}

/// Hyper-V WMI namespace.
pub const HYPERV_NAMESPACE: &str = r"root\virtualization\v2";

/// Default connection timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// WBEM_E_ACCESS_DENIED and WBEM_E_INVALID_AUTHENTICATION.
const AUTH_HRESULTS: [u32; 2] = [0x8004_1003, 0x8004_1017];

/// Credentials for a remote host.
#[derive(Clone)]
pub struct Credentials {
    pub domain: Option<String>,
    pub username: String,
    password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            domain: None,
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// `domain\user`, or the bare user name without a domain.
    pub fn full_username(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}\\{}", domain, self.username),
            None => self.username.clone(),
        }
    }
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Target machine name (None for local).
    pub machine_name: Option<String>,
    pub credentials: Option<Credentials>,
    pub timeout: Duration,
    pub namespace: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            machine_name: None,
            credentials: None,
            timeout: DEFAULT_TIMEOUT,
            namespace: HYPERV_NAMESPACE.to_string(),
        }
    }
}

impl ConnectionConfig {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn remote(machine_name: impl Into<String>) -> Self {
        Self {
            machine_name: Some(machine_name.into()),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Name reported in errors and logs.
    pub fn host_name(&self) -> &str {
        self.machine_name.as_deref().unwrap_or("localhost")
    }

    fn namespace_path(&self) -> String {
        match &self.machine_name {
            Some(machine) => format!("\\\\{}\\{}", machine, self.namespace),
            None => self.namespace.clone(),
        }
    }
}

pub(crate) fn method_error(class: &str, method: &str, e: windows::core::Error) -> Error {
    Error::WmiMethod {
        class: class.to_string(),
        method: method.to_string(),
        hresult: e.code().0 as u32,
        message: e.message().to_string(),
    }
}

fn query_error(query: &str, e: windows::core::Error) -> Error {
    Error::WmiQuery {
        query: query.to_string(),
        hresult: e.code().0 as u32,
        message: e.message().to_string(),
    }
}

/// An open WMI services proxy.
pub struct WmiConnection {
    services: IWbemServices,
    config: ConnectionConfig,
}

impl std::fmt::Debug for WmiConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WmiConnection")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WmiConnection {
    /// Connect to the namespace in `config`.
    ///
    /// Reachability failures become `Error::Connection` and credential
    /// rejections become `Error::AuthenticationFailed`.
    pub fn connect(config: ConnectionConfig) -> Result<Self> {
        let machine = config.host_name().to_string();
        let connection_error = |e: windows::core::Error| Error::Connection {
            machine: machine.clone(),
            message: e.message().to_string(),
            failure_type: FailureType::Network,
        };

        unsafe {
            Self::init_com();

            let locator: IWbemLocator = CoCreateInstance(&WbemLocator, None, CLSCTX_INPROC_SERVER)
                .map_err(connection_error)?;

            let namespace = BSTR::from(config.namespace_path());
            let services = match &config.credentials {
                Some(credentials) => locator
                    .ConnectServer(
                        &namespace,
                        &BSTR::from(credentials.full_username()),
                        &BSTR::from(credentials.password.as_str()),
                        &BSTR::new(),
                        WBEM_FLAG_CONNECT_USE_MAX_WAIT.0 as i32,
                        &BSTR::new(),
                        None,
                    )
                    .map_err(|e| {
                        if AUTH_HRESULTS.contains(&(e.code().0 as u32)) {
                            Error::AuthenticationFailed {
                                machine: machine.clone(),
                                username: credentials.full_username(),
                                message: e.message().to_string(),
                            }
                        } else {
                            connection_error(e)
                        }
                    })?,
                None => locator
                    .ConnectServer(
                        &namespace,
                        &BSTR::new(),
                        &BSTR::new(),
                        &BSTR::new(),
                        WBEM_FLAG_CONNECT_USE_MAX_WAIT.0 as i32,
                        &BSTR::new(),
                        None,
                    )
                    .map_err(connection_error)?,
            };

            CoSetProxyBlanket(
                &services,
                RPC_C_AUTHN_WINNT,
                RPC_C_AUTHZ_NONE,
                None,
                RPC_C_AUTHN_LEVEL_CALL,
                RPC_C_IMP_LEVEL_IMPERSONATE,
                None,
                EOAC_NONE,
            )
            .map_err(connection_error)?;

            Ok(Self { services, config })
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    // COM stays initialized for the life of the thread.
    fn init_com() {
        COM_INITIALIZED.with(|initialized| {
            if !initialized.get() {
                unsafe {
                    let _ = CoInitializeEx(None, COINIT_MULTITHREADED);
                    let _ = CoInitializeSecurity(
                        None,
                        -1,
                        None,
                        None,
                        RPC_C_AUTHN_LEVEL_DEFAULT,
                        RPC_C_IMP_LEVEL_IMPERSONATE,
                        None,
                        EOAC_NONE,
                        None,
                    );
                }
                initialized.set(true);
            }
        })
    }

    /// Execute a WQL query and return all results.
    pub fn query(&self, wql: &str) -> Result<Vec<IWbemClassObject>> {
        tracing::trace!(query = wql, "WQL query");
        let enumerator = unsafe {
            self.services
                .ExecQuery(
                    &BSTR::from("WQL"),
                    &BSTR::from(wql),
                    WBEM_FLAG_FORWARD_ONLY | WBEM_FLAG_RETURN_IMMEDIATELY,
                    None,
                )
                .map_err(|e| query_error(wql, e))?
        };
        Self::collect_results(enumerator, wql)
    }

    pub fn query_first(&self, wql: &str) -> Result<Option<IWbemClassObject>> {
        Ok(self.query(wql)?.into_iter().next())
    }

    /// Fetch an object by its `__PATH`.
    pub fn get_object(&self, path: &str) -> Result<IWbemClassObject> {
        let mut object = None;
        unsafe {
            self.services
                .GetObject(&BSTR::from(path), Default::default(), None, Some(&mut object), None)
                .map_err(|e| query_error(path, e))?;
        }
        object.ok_or_else(|| Error::MissingProperty(format!("object {}", path)))
    }

    /// A blank instance of `class_name`.
    pub fn spawn_instance(&self, class_name: &str) -> Result<IWbemClassObject> {
        let class = self.get_object(class_name)?;
        unsafe {
            class
                .SpawnInstance(0)
                .map_err(|e| method_error(class_name, "SpawnInstance", e))
        }
    }

    /// Default settings template for a resource subtype.
    ///
    /// Walks the primordial `Msvm_ResourcePool` to its allocation
    /// capabilities and returns the setting whose `ValueRole` is 0
    /// (default). Hyper-V rejects blank spawned instances for most
    /// resource types, so additions start from this template.
    pub fn get_default_resource(&self, resource_subtype: &str) -> Result<IWbemClassObject> {
        let missing = |what: &str| {
            Error::MissingProperty(format!("{} for resource subtype {}", what, resource_subtype))
        };

        let pool = self
            .query_first(&format!(
                "SELECT * FROM Msvm_ResourcePool WHERE ResourceSubType = '{}' AND Primordial = TRUE",
                escape_wql(resource_subtype)
            ))?
            .ok_or_else(|| missing("primordial resource pool"))?;

        let capabilities = self
            .query_first(&format!(
                "ASSOCIATORS OF {{{}}} WHERE AssocClass = Msvm_ElementCapabilities ResultClass = Msvm_AllocationCapabilities",
                pool.get_path()?
            ))?
            .ok_or_else(|| missing("allocation capabilities"))?;

        let references = self.query(&format!(
            "REFERENCES OF {{{}}} WHERE ResultClass = Msvm_SettingsDefineCapabilities",
            capabilities.get_path()?
        ))?;
        for reference in references {
            if reference.get_u16("ValueRole")? == Some(0) {
                if let Some(part) = reference.get_string_prop("PartComponent")? {
                    return self.get_object(&part);
                }
            }
        }
        Err(missing("default settings"))
    }

    /// The single instance of a service class.
    pub fn get_singleton(&self, class_name: &str) -> Result<IWbemClassObject> {
        self.query_first(&format!("SELECT * FROM {}", class_name))?
            .ok_or_else(|| Error::MissingProperty(format!("singleton {}", class_name)))
    }

    /// Input parameter instance for `class_name.method_name`.
    pub fn get_method_params(&self, class_name: &str, method_name: &str) -> Result<IWbemClassObject> {
        let class = self.get_object(class_name)?;
        let method = HSTRING::from(method_name);
        let mut in_params = None;
        let mut out_params = None;
        unsafe {
            class
                .GetMethod(PCWSTR(method.as_ptr()), 0, &mut in_params, &mut out_params)
                .map_err(|e| method_error(class_name, method_name, e))?;
            let in_params = in_params.ok_or_else(|| {
                Error::MissingProperty(format!("{}.{} parameters", class_name, method_name))
            })?;
            in_params
                .SpawnInstance(0)
                .map_err(|e| method_error(class_name, method_name, e))
        }
    }

    /// Invoke a method on the object at `object_path`.
    pub fn exec_method(
        &self,
        object_path: &str,
        method_name: &str,
        in_params: Option<&IWbemClassObject>,
    ) -> Result<IWbemClassObject> {
        tracing::debug!(method = method_name, "WMI method call");
        let mut out_params = None;
        unsafe {
            self.services
                .ExecMethod(
                    &BSTR::from(object_path),
                    &BSTR::from(method_name),
                    Default::default(),
                    None,
                    in_params,
                    Some(&mut out_params),
                    None,
                )
                .map_err(|e| method_error(object_path, method_name, e))?;
        }
        out_params.ok_or_else(|| Error::MissingProperty(format!("{} output", method_name)))
    }

    fn collect_results(
        enumerator: IEnumWbemClassObject,
        wql: &str,
    ) -> Result<Vec<IWbemClassObject>> {
        let mut results = Vec::new();
        loop {
            let mut objects: [Option<IWbemClassObject>; 1] = [None];
            let mut returned = 0u32;
            let hr = unsafe { enumerator.Next(WBEM_INFINITE, &mut objects, &mut returned) };
            if hr.is_err() {
                return Err(query_error(wql, windows::core::Error::from_hresult(hr)));
            }
            if returned == 0 {
                break;
            }
            if let Some(object) = objects[0].take() {
                results.push(object);
            }
        }
        Ok(results)
    }
}

/// Quote a value for a WQL string literal.
pub fn escape_wql(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "''")
}

/// Typed property access on WMI objects.
pub trait WbemClassObjectExt {
    fn get_prop<T: FromVariant>(&self, name: &str) -> Result<Option<T>>;

    fn get_string_prop(&self, name: &str) -> Result<Option<String>> {
        self.get_prop(name)
    }

    fn get_u16(&self, name: &str) -> Result<Option<u16>> {
        self.get_prop(name)
    }

    fn get_u32(&self, name: &str) -> Result<Option<u32>> {
        self.get_prop(name)
    }

    fn get_u64(&self, name: &str) -> Result<Option<u64>> {
        self.get_prop(name)
    }

    fn get_bool(&self, name: &str) -> Result<Option<bool>> {
        self.get_prop(name)
    }

    fn get_string_array(&self, name: &str) -> Result<Option<Vec<String>>> {
        self.get_prop(name)
    }

    /// The object's `__PATH`.
    fn get_path(&self) -> Result<String> {
        self.get_string_prop("__PATH")?
            .ok_or_else(|| Error::MissingProperty("__PATH".to_string()))
    }

    fn put(&self, name: &str, value: &VARIANT) -> Result<()>;

    fn put_string(&self, name: &str, value: &str) -> Result<()> {
        self.put(name, &VARIANT::from(BSTR::from(value)))
    }

    // uint16 and uint32 are put as their signed counterparts.
    fn put_u16(&self, name: &str, value: u16) -> Result<()> {
        self.put(name, &VARIANT::from(value as i16))
    }

    fn put_u32(&self, name: &str, value: u32) -> Result<()> {
        self.put(name, &VARIANT::from(value as i32))
    }

    // uint64 travels as a decimal string.
    fn put_u64(&self, name: &str, value: u64) -> Result<()> {
        self.put_string(name, &value.to_string())
    }

    fn put_bool(&self, name: &str, value: bool) -> Result<()> {
        self.put(name, &VARIANT::from(value))
    }

    fn put_string_array(&self, name: &str, values: &[String]) -> Result<()>;

    /// Serialize as an embedded instance (WMI DTD 2.0).
    fn get_text(&self) -> Result<String>;
}

impl WbemClassObjectExt for IWbemClassObject {
    fn get_prop<T: FromVariant>(&self, name: &str) -> Result<Option<T>> {
        let property = HSTRING::from(name);
        let mut value = VARIANT::default();
        unsafe {
            // Absent properties read as None.
            if self
                .Get(PCWSTR(property.as_ptr()), 0, &mut value, None, None)
                .is_err()
            {
                return Ok(None);
            }
            T::from_variant(&value, name)
        }
    }

    fn put(&self, name: &str, value: &VARIANT) -> Result<()> {
        let property = HSTRING::from(name);
        unsafe {
            self.Put(PCWSTR(property.as_ptr()), 0, value, 0)
                .map_err(|e| method_error("IWbemClassObject", "Put", e))
        }
    }

    fn put_string_array(&self, name: &str, values: &[String]) -> Result<()> {
        use windows::Win32::System::Com::SAFEARRAYBOUND;
        use windows::Win32::System::Ole::{SafeArrayCreate, SafeArrayPutElement};
        use windows::Win32::System::Variant::{VT_ARRAY, VT_BSTR};

        unsafe {
            let bounds = SAFEARRAYBOUND {
                cElements: values.len() as u32,
                lLbound: 0,
            };
            let sa = SafeArrayCreate(VT_BSTR, 1, &bounds);
            if sa.is_null() {
                return Err(Error::MissingProperty(format!("array storage for {}", name)));
            }

            // The VARIANT owns the array from here and frees it on drop.
            let mut variant = VARIANT::default();
            (*variant.Anonymous.Anonymous).vt = VT_ARRAY | VT_BSTR;
            (*variant.Anonymous.Anonymous).Anonymous.parray = sa;

            for (i, value) in values.iter().enumerate() {
                // PutElement copies the string, so the original is freed here.
                let raw = BSTR::from(value.as_str()).into_raw();
                let put = SafeArrayPutElement(sa, &(i as i32), raw as *const _);
                drop(BSTR::from_raw(raw));
                put.map_err(|e| method_error("SafeArray", "PutElement", e))?;
            }

            self.put(name, &variant)
        }
    }

    fn get_text(&self) -> Result<String> {
        use windows::Win32::System::Wmi::{
            IWbemObjectTextSrc, WbemObjectTextSrc, WMI_OBJ_TEXT_WMI_DTD_2_0,
        };

        unsafe {
            let text_src: IWbemObjectTextSrc =
                CoCreateInstance(&WbemObjectTextSrc, None, CLSCTX_INPROC_SERVER)
                    .map_err(|e| method_error("WbemObjectTextSrc", "CoCreateInstance", e))?;
            let text = text_src
                .GetText(0, self, WMI_OBJ_TEXT_WMI_DTD_2_0.0 as u32, None)
                .map_err(|e| method_error("IWbemObjectTextSrc", "GetText", e))?;
            String::try_from(&text).map_err(|_| Error::TypeConversion {
                property: "embedded instance".to_string(),
                expected: "String",
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_with_domain() {
        let creds = Credentials::new("admin", "secret").with_domain("CONTOSO");
        assert_eq!(creds.full_username(), "CONTOSO\\admin");
        assert_eq!(Credentials::new("admin", "secret").full_username(), "admin");
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let debug = format!("{:?}", Credentials::new("admin", "hunter2"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_namespace_path() {
        assert_eq!(ConnectionConfig::local().namespace_path(), HYPERV_NAMESPACE);
        assert_eq!(
            ConnectionConfig::remote("hv01").namespace_path(),
            r"\\hv01\root\virtualization\v2"
        );
        assert_eq!(ConnectionConfig::local().host_name(), "localhost");
    }

    #[test]
    fn test_escape_wql() {
        assert_eq!(escape_wql("O'Brien"), "O''Brien");
        assert_eq!(escape_wql(r"C:\vm\a.vhdx"), r"C:\\vm\\a.vhdx");
    }
}
