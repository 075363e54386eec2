use std::ffi::{c_char, c_void, CStr};
use ash::vk;
use color_eyre::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::Window;

/// Keeps the Vulkan entry, instance, debug messenger and window surface alive
pub struct Instance {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::khr::surface::Instance,
    debug_utils: Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
}

impl Instance {
    const REQUIRED_VALIDATION_LAYERS: &'static [&'static CStr] = &[c"VK_LAYER_KHRONOS_validation"];

    pub fn new(window: &Window) -> Result<Self> {
        let entry = ash::Entry::linked();
        let validation = cfg!(debug_assertions) && Self::validation_layers_supported(&entry)?;
        if cfg!(debug_assertions) && !validation {
            log::warn!("Validation layers requested but not available");
        }

        let instance = Self::create_instance(&entry, window, validation)?;

        let debug_utils = if validation {
            match Self::create_debug_utils_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        let surface = match Self::create_surface(&entry, &instance, window) {
            Ok(surface) => surface,
            Err(e) => {
                unsafe {
                    if let Some((messenger, loader)) = &debug_utils {
                        loader.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            entry,
            instance,
            surface,
            surface_loader,
            debug_utils,
        })
    }

    fn create_instance(
        entry: &ash::Entry,
        window: &Window,
        validation: bool,
    ) -> Result<ash::Instance> {
        let application_info = vk::ApplicationInfo::default()
            .application_name(c"vellum")
            .engine_name(c"vellum")
            .api_version(vk::API_VERSION_1_2);
        let enabled_layer_names = if validation {
            Self::REQUIRED_VALIDATION_LAYERS
                .iter()
                .map(|layer| layer.as_ptr())
                .collect::<Vec<*const c_char>>()
        } else {
            Vec::new()
        };
        let enabled_extension_names = Self::required_instance_extensions(window, validation)?
            .iter()
            .map(|ext| ext.as_ptr())
            .collect::<Vec<*const c_char>>();
        let mut debug_info = debug_utils_messenger_create_info();
        let mut instance_info = vk::InstanceCreateInfo::default()
            .application_info(&application_info)
            .enabled_layer_names(&enabled_layer_names)
            .enabled_extension_names(&enabled_extension_names);
        if validation {
            instance_info = instance_info.push_next(&mut debug_info);
        }

        #[cfg(target_os = "macos")]
        let instance_info = instance_info.flags(vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR);

        Ok(unsafe { entry.create_instance(&instance_info, None)? })
    }

    fn create_debug_utils_messenger(
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let info = debug_utils_messenger_create_info();
        let messenger = unsafe { loader.create_debug_utils_messenger(&info, None)? };
        Ok((messenger, loader))
    }

    fn create_surface(
        entry: &ash::Entry,
        instance: &ash::Instance,
        window: &Window,
    ) -> Result<vk::SurfaceKHR> {
        Ok(unsafe {
            ash_window::create_surface(
                entry,
                instance,
                window.display_handle()?.as_raw(),
                window.window_handle()?.as_raw(),
                None,
            )?
        })
    }

    fn required_instance_extensions(
        window: &Window,
        validation: bool,
    ) -> Result<Vec<&'static CStr>> {
        let mut exts = ash_window::enumerate_required_extensions(window.display_handle()?.as_raw())?
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(*ext) })
            .collect::<Vec<_>>();

        if validation {
            exts.push(ash::ext::debug_utils::NAME);
        }

        #[cfg(target_os = "macos")]
        {
            exts.push(ash::khr::portability_enumeration::NAME);
            exts.push(ash::khr::get_physical_device_properties2::NAME);
        }

        Ok(exts)
    }

    fn validation_layers_supported(entry: &ash::Entry) -> Result<bool> {
        let supported = unsafe { entry.enumerate_instance_layer_properties()? };
        Ok(Self::REQUIRED_VALIDATION_LAYERS.iter().all(|required| {
            supported
                .iter()
                .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == *required))
        }))
    }

    /// Destroys the surface, messenger and instance. Every device object must be gone.
    pub unsafe fn destroy(&mut self) {
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((messenger, loader)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn debug_utils_messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    let message_severity = vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR;
    let message_type = vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE;
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(message_severity)
        .message_type(message_type)
        .pfn_user_callback(Some(debug_callback))
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let msg_type = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        _ => "[Unknown]",
    };
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let msg = unsafe { CStr::from_ptr((*p_callback_data).p_message) };
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => log::trace!("{msg_type} {msg:?}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("{msg_type} {msg:?}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("{msg_type} {msg:?}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("{msg_type} {msg:?}"),
        _ => log::warn!("[Unknown]{msg_type} {msg:?}"),
    }

    vk::FALSE
}
