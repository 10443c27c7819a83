//! Portal page geography
//!
//! Every DOM selector and URL fragment the engines touch lives here. The
//! portal ships UI updates without notice; when a flow breaks, this file is
//! where the fix lands.

/// URL fragments, joined onto the configured portal base URL.
pub mod urls {
    /// Login form.
    pub const LOGIN_PATH: &str = "/account/login";
    /// Substring of the URL a successful login lands on.
    pub const LANDING_MARKER: &str = "/containers";
    /// Substring present when the portal bounces bad credentials.
    pub const INVALID_LOGIN_MARKER: &str = "login?error";
    /// Container watchlist (the virtualized listing).
    pub const CONTAINERS_PATH: &str = "/containers";
    /// Appointment listing page.
    pub const APPOINTMENTS_PATH: &str = "/appointments";
    /// The three-step appointment booking wizard.
    pub const BOOKING_WIZARD_PATH: &str = "/appointments/new";
}

/// Login page and captcha widget.
pub mod login {
    pub const USERNAME_INPUT: &str = "input[formcontrolname='username']";
    pub const PASSWORD_INPUT: &str = "input[formcontrolname='password']";
    pub const SUBMIT_BUTTON: &str = "button[type='submit']";

    pub const CAPTCHA_CHECKBOX: &str = "#recaptcha-anchor";
    /// Checkbox reports solved.
    pub const CAPTCHA_SUCCESS: &str = "#recaptcha-anchor[aria-checked='true']";
    /// Affordance to switch to the audio challenge.
    pub const CAPTCHA_AUDIO_BUTTON: &str = "#recaptcha-audio-button";
    /// Spinner that sometimes wedges instead of resolving.
    pub const CAPTCHA_SPINNER: &str = ".recaptcha-checkbox-spinner[aria-busy='true']";
    /// The visual image-grid challenge; not solvable here.
    pub const CAPTCHA_IMAGE_GRID: &str = ".rc-imageselect";
    pub const CAPTCHA_AUDIO_SOURCE: &str = "#audio-source";
    pub const CAPTCHA_AUDIO_INPUT: &str = "#audio-response";
    pub const CAPTCHA_VERIFY_BUTTON: &str = "#recaptcha-verify-button";

    /// Post-login nags, dismissed in order if present.
    pub const POPUP_DISMISSALS: &[&str] = &[
        ".cdk-overlay-container button.mat-dialog-close",
        ".notification-prompt button.decline",
        ".save-password-bubble button.dismiss",
    ];
}

/// Virtualized listing page (containers and appointments share the layout).
pub mod listing {
    /// Scroll target candidates, most specific first.
    pub const SCROLL_CONTAINERS: &[&str] = &[
        "cdk-virtual-scroll-viewport",
        ".results-list__scroller",
        ".results-pane",
    ];
    /// Pane whose innerText the row counter reads.
    pub const RESULTS_PANE: &str = ".results-pane";

    pub const MASTER_CHECKBOX_INPUT: &str = "thead mat-checkbox input[type='checkbox']";
    pub const MASTER_CHECKBOX_CELL: &str = "thead mat-checkbox";
    pub const ROW_CHECKBOX_INPUTS: &str = "tbody tr mat-checkbox input[type='checkbox']";
    pub const EXPORT_BUTTON: &str = "button[data-action='export-excel']";
}

/// Expanded container detail card.
pub mod detail {
    pub const DETAIL_CARD: &str = ".container-detail-card";
    pub const TIMELINE_ITEMS: &str = ".container-detail-card .timeline__milestone";
    /// Class carried by a milestone node once the portal marks it done.
    pub const MILESTONE_DONE_CLASS: &str = "milestone--completed";
    /// The pregate milestone node.
    pub const PREGATE_MILESTONE: &str =
        ".container-detail-card .timeline__milestone[data-milestone='pregate']";
    /// Label text next to the booking number value cell.
    pub const BOOKING_LABEL_TEXT: &str = "Booking #";
}

/// Appointment booking wizard.
pub mod wizard {
    /// Active step header; `aria-posinset` carries the 1-based phase.
    pub const ACTIVE_STEP: &str = ".mat-step-header[aria-selected='true']";
    pub const NEXT_BUTTON: &str = "button.stepper-next";
    pub const SUBMIT_BUTTON: &str = "button.appointment-submit";
    /// Validation toast the portal raises instead of advancing.
    pub const TOAST: &str = "snack-bar-container .toast-message";

    pub const CONTAINER_ID_INPUT: &str = "input[formcontrolname='containerNumber']";
    pub const BOOKING_NUMBER_INPUT: &str = "input[formcontrolname='bookingNumber']";
    pub const QUANTITY_INPUT: &str = "input[formcontrolname='quantity']";
    pub const PIN_INPUT: &str = "input[formcontrolname='pinCode']";
    pub const UNIT_NUMBER_INPUT: &str = "input[formcontrolname='unitNumber']";
    pub const SEAL_INPUTS: &[&str] = &[
        "input[formcontrolname='sealOne']",
        "input[formcontrolname='sealTwo']",
        "input[formcontrolname='sealThree']",
        "input[formcontrolname='sealFour']",
    ];
    pub const TRUCK_PLATE_INPUT: &str = "input[formcontrolname='truckPlate']";
    pub const AUTOCOMPLETE_OPTIONS: &str = ".mat-autocomplete-panel mat-option";
    pub const OWN_CHASSIS_TOGGLE: &str = "mat-slide-toggle[formcontrolname='ownChassis']";
    pub const OWN_CHASSIS_INPUT: &str =
        "mat-slide-toggle[formcontrolname='ownChassis'] input[type='checkbox']";
    /// Row checkbox selecting the container inside the wizard's phase 2 table.
    pub const CONTAINER_ROW_CHECKBOX: &str =
        ".wizard-container-table tbody mat-checkbox input[type='checkbox']";

    pub const TIME_DROPDOWN: &str = "mat-select[formcontrolname='appointmentTime']";
    pub const TIME_OPTIONS: &str = ".mat-select-panel mat-option .mat-option-text";
    pub const CALENDAR_ICON: &str = "mat-datepicker-toggle button";

    /// Labels of the dropdowns each phase fills, exactly as displayed.
    pub const TRUCKING_COMPANY_LABEL: &str = "Trucking Company";
    pub const TERMINAL_LABEL: &str = "Terminal";
    pub const MOVE_TYPE_LABEL: &str = "Move Type";
}
