// Vulkan instance
//
// This holds all of the common instance code for the Vulkan device
use ash::extensions::ext;
use ash::{vk, Entry};

use crate::{CreateInfo, Result, StrataError};

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

// Forwards validation messages to the log
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    let message = match p_callback_data.as_ref() {
        Some(data) if !data.p_message.is_null() => {
            CStr::from_ptr(data.p_message).to_string_lossy().into_owned()
        }
        _ => String::from("<no message>"),
    };

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[VK][{:?}] {}", message_types, message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[VK][{:?}] {}", message_types, message);
    } else {
        log::debug!("[VK][{:?}] {}", message_types, message);
    }
    vk::FALSE
}

/// A Vulkan Instance
///
/// Owns the loaded library and the instance, plus the debug messenger
/// when validation is enabled.
pub struct Instance {
    debug: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    /// the entry loads function pointers from the dynamic library, it
    /// must outlive `inst`
    #[allow(dead_code)]
    pub(crate) loader: Entry,
    pub(crate) inst: ash::Instance,
}

impl Instance {
    /// Registers our callback so validation errors reach the log
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = unsafe { dr_loader.create_debug_utils_messenger(&debug_info, None)? };
        Ok((dr_loader, callback))
    }

    /// Is the Khronos validation layer installed
    fn validation_available(entry: &Entry) -> bool {
        entry
            .enumerate_instance_layer_properties()
            .map(|layers| {
                layers.iter().any(|l| {
                    let name = unsafe { CStr::from_ptr(l.layer_name.as_ptr()) };
                    name.to_bytes() == VALIDATION_LAYER.as_bytes()
                })
            })
            .unwrap_or(false)
    }

    /// Load the Vulkan library and create a vkInstance
    ///
    /// Validation is only turned on if requested and the layer exists.
    pub fn new(info: &CreateInfo) -> Result<Self> {
        let entry = unsafe { Entry::load() }.or(Err(StrataError::VK_LOADING))?;
        let app_name =
            CString::new(info.application_name.as_str()).or(Err(StrataError::INVALID))?;
        let engine_name = CString::new("strata").or(Err(StrataError::INVALID))?;

        let validate = info.enable_validation && Self::validation_available(&entry);
        if info.enable_validation && !validate {
            log::warn!("{} requested but not installed", VALIDATION_LAYER);
        }

        let layer_names = match validate {
            true => vec![CString::new(VALIDATION_LAYER).or(Err(StrataError::INVALID))?],
            false => Vec::new(),
        };
        let layer_names_raw: Vec<*const c_char> = layer_names
            .iter()
            .map(|raw_name: &CString| raw_name.as_ptr())
            .collect();

        let mut extension_names_raw = Vec::new();
        if validate {
            extension_names_raw.push(ext::DebugUtils::name().as_ptr());
        }

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&engine_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_2)
            .build();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw)
            .build();

        let instance: ash::Instance = unsafe { entry.create_instance(&create_info, None)? };

        let debug = match validate {
            true => match Self::setup_debug(&entry, &instance) {
                Ok(d) => Some(d),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            },
            false => None,
        };

        Ok(Self {
            debug: debug,
            loader: entry,
            inst: instance,
        })
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, callback)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(callback, None);
            }
            self.inst.destroy_instance(None);
        }
    }
}
