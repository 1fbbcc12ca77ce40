#[cfg(all(
    not(sio_force_select),
    any(target_os = "android", target_os = "illumos", target_os = "linux")
))]
mod epoll;

#[cfg(all(
    not(sio_force_select),
    any(target_os = "android", target_os = "illumos", target_os = "linux")
))]
pub(crate) use self::epoll::{event, Event, Events, Selector};

#[cfg(all(
    not(sio_force_select),
    any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "tvos",
        target_os = "watchos",
    )
))]
mod kqueue;

#[cfg(all(
    not(sio_force_select),
    any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "tvos",
        target_os = "watchos",
    )
))]
pub(crate) use self::kqueue::{event, Event, Events, Selector};

#[cfg(any(
    sio_force_select,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "illumos",
        target_os = "ios",
        target_os = "linux",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "tvos",
        target_os = "watchos",
    ))
))]
mod select;

#[cfg(any(
    sio_force_select,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "illumos",
        target_os = "ios",
        target_os = "linux",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "tvos",
        target_os = "watchos",
    ))
))]
pub(crate) use self::select::{event, Event, Events, Selector};
